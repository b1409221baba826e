//! Client-side subscription lifecycle: SUBSCRIBE, RENEW, UNSUBSCRIBE and
//! the auto-renew task.
//!
//! The handle lock is never held across the HTTP exchange; handle validity
//! is re-checked afterwards. SUBSCRIBE runs under the subscription
//! serializer so a publisher's first NOTIFY (SEQ 0) can wait for the
//! record to be published instead of bouncing with 412.

use std::sync::Arc;

use url::Url;

use super::sids::gena_sid_uuid;
use super::{CP_MINIMUM_SUBSCRIPTION_TIME, TIMEOUT_INFINITE};
use crate::error::{Result, UpnpError};
use crate::events::UpnpEvent;
use crate::handles::{ClientSubscription, HandleId};
use crate::runtime::RuntimeInner;
use crate::ssdp::device::server_string;
use crate::threadutil::{JobPriority, PoolError, TimerDuration, TimerId, When};

/// Parse `Second-N` / `Second-infinite` (case-insensitive), as found in
/// TIMEOUT response headers.
fn parse_timeout_header(value: &str) -> Option<i32> {
    let rest = value.trim();
    if rest.len() < 7 || !rest[..7].eq_ignore_ascii_case("second-") {
        return None;
    }
    let rest = &rest[7..];
    if rest.eq_ignore_ascii_case("infinite") {
        return Some(TIMEOUT_INFINITE);
    }
    rest.parse().ok().filter(|v| *v >= 0)
}

/// Event callback URL we hand to publishers: our address and the host's
/// NOTIFY server port, family-matched to the publisher.
fn callback_url(rt: &RuntimeInner, publisher: &Url) -> String {
    let (v4_port, v6_port) = rt.local_ports();
    match publisher.host() {
        Some(url::Host::Ipv6(_)) => {
            let addr = rt
                .net
                .first_v6
                .map(|a| a.to_string())
                .unwrap_or_else(|| "::1".to_string());
            format!("http://[{addr}]:{v6_port}")
        }
        _ => {
            let addr = rt
                .net
                .first_v4
                .map(|a| a.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            format!("http://{addr}:{v4_port}")
        }
    }
}

/// One SUBSCRIBE exchange (fresh subscription or renewal). On 200, returns
/// the publisher-assigned SID and stores the granted timeout back into
/// `timeout`.
fn gena_http_subscribe(
    rt: &RuntimeInner,
    url_str: &str,
    timeout: &mut i32,
    renewal_sid: Option<&str>,
) -> Result<String> {
    let url = Url::parse(url_str).map_err(|_| UpnpError::InvalidArgument("bad publisher URL"))?;

    let requested = if *timeout < 0 {
        "infinite".to_string()
    } else {
        (*timeout).max(CP_MINIMUM_SUBSCRIPTION_TIME).to_string()
    };
    let mut headers: Vec<(String, String)> = Vec::with_capacity(3);
    match renewal_sid {
        Some(sid) => headers.push(("SID".into(), sid.to_string())),
        None => {
            headers.push((
                "CALLBACK".into(),
                format!("<{}/>", callback_url(rt, &url)),
            ));
            headers.push(("NT".into(), "upnp:event".into()));
        }
    }
    headers.push(("TIMEOUT".into(), format!("Second-{requested}")));

    let response = rt.http.request("SUBSCRIBE", url.as_str(), &headers)?;
    if response.status != 200 {
        return Err(UpnpError::SubscribeUnaccepted(response.status));
    }
    let sid = response
        .header("sid")
        .ok_or(UpnpError::BadResponse)?
        .to_string();
    *timeout = response
        .header("timeout")
        .and_then(parse_timeout_header)
        .ok_or(UpnpError::BadResponse)?;
    Ok(sid)
}

/// Arm the renew timer at `timeout - auto_renew_guard` seconds (floored at
/// zero). The fired job re-resolves everything through the handle table.
fn schedule_auto_renew(
    rt: &RuntimeInner,
    handle: HandleId,
    timeout: i32,
    sid: &str,
    event_url: &str,
) -> std::result::Result<TimerId, PoolError> {
    let delay = (i64::from(timeout) - i64::from(rt.config.auto_renew_guard)).max(0) as u64;
    let weak = rt.weak();
    let sid = sid.to_string();
    let event_url = event_url.to_string();
    rt.timer.schedule(
        TimerDuration::ShortTerm,
        When::RelativeSecs(delay),
        JobPriority::Med,
        move || {
            if let Some(rt) = weak.upgrade() {
                auto_renew_fired(&rt, handle, sid, event_url, timeout);
            }
        },
    )
}

/// Renew-timer body. Guard zero means autorenewal is disabled: the
/// subscription is dropped and the host told it expired. Otherwise renew,
/// and report failures the host can do something about.
fn auto_renew_fired(
    rt: &Arc<RuntimeInner>,
    handle: HandleId,
    sid: String,
    event_url: String,
    timeout: i32,
) {
    if rt.config.auto_renew_guard == 0 {
        log::info!("gena: subscription {sid} expired");
        let callback = {
            let mut handles = rt.handles.lock();
            let Ok(client) = handles.client_mut(handle) else {
                return;
            };
            match client.subscriptions.iter().position(|s| s.sid == sid) {
                Some(at) => {
                    client.subscriptions.remove(at);
                    Some(Arc::clone(&client.callback))
                }
                None => None,
            }
        };
        if let Some(callback) = callback {
            callback(&UpnpEvent::SubscriptionExpired { sid, event_url });
        }
        return;
    }

    log::debug!("gena: auto-renewing {sid}");
    let mut timeout = timeout;
    match renew(rt, handle, &sid, &mut timeout) {
        Ok(()) => {}
        // The subscription or handle vanished under us; nothing to report.
        Err(UpnpError::InvalidSid) | Err(UpnpError::InvalidHandle) => {}
        Err(error) => {
            let callback = {
                let handles = rt.handles.lock();
                handles.client(handle).ok().map(|c| Arc::clone(&c.callback))
            };
            if let Some(callback) = callback {
                callback(&UpnpEvent::AutoRenewalFailed {
                    sid,
                    event_url,
                    error,
                });
            }
        }
    }
}

/// Subscribe to `publisher_url`. `timeout` carries the desired lifetime in
/// and the granted one out ([`TIMEOUT_INFINITE`] for no expiry). Returns
/// the locally generated SID the host uses from here on.
pub(crate) fn subscribe(
    rt: &RuntimeInner,
    handle: HandleId,
    publisher_url: &str,
    timeout: &mut i32,
) -> Result<String> {
    {
        let handles = rt.handles.lock();
        handles.client(handle)?;
    }

    // Serialize against NOTIFY's first-event race and other subscribes.
    let _serializer = rt.subscribe_lock.lock();
    let actual_sid = gena_http_subscribe(rt, publisher_url, timeout, None)?;

    let mut handles = rt.handles.lock();
    handles.client(handle)?;

    let sid = format!("uuid:{}", gena_sid_uuid());
    let renew_timer = if *timeout == TIMEOUT_INFINITE {
        None
    } else {
        Some(
            schedule_auto_renew(rt, handle, *timeout, &sid, publisher_url)
                .map_err(UpnpError::from)?,
        )
    };
    // The record becomes visible before the handle lock is released; the
    // renew job and NOTIFY dispatch both need that lock, so neither can
    // miss it.
    let client = handles.client_mut(handle)?;
    client.subscriptions.push(ClientSubscription {
        sid: sid.clone(),
        actual_sid,
        event_url: publisher_url.to_string(),
        renew_timer,
    });
    log::debug!("gena: subscribed {sid} to {publisher_url}, timeout {timeout:?}");
    Ok(sid)
}

/// Renew an existing subscription by our SID. On network failure the
/// subscription is removed; the publisher has likely forgotten us anyway.
pub(crate) fn renew(
    rt: &RuntimeInner,
    handle: HandleId,
    sid: &str,
    timeout: &mut i32,
) -> Result<()> {
    let (actual_sid, event_url) = {
        let mut handles = rt.handles.lock();
        let client = handles.client_mut(handle)?;
        let sub = client
            .subscriptions
            .iter_mut()
            .find(|s| s.sid == sid)
            .ok_or(UpnpError::InvalidSid)?;
        if let Some(timer) = sub.renew_timer.take() {
            rt.timer.remove(timer);
        }
        (sub.actual_sid.clone(), sub.event_url.clone())
    };

    let exchange = gena_http_subscribe(rt, &event_url, timeout, Some(&actual_sid));

    let mut handles = rt.handles.lock();
    let client = handles.client_mut(handle)?;
    let new_actual = match exchange {
        Ok(new_actual) => new_actual,
        Err(e) => {
            if let Some(at) = client.subscriptions.iter().position(|s| s.sid == sid) {
                client.subscriptions.remove(at);
            }
            return Err(e);
        }
    };

    let renew_timer = if *timeout == TIMEOUT_INFINITE {
        None
    } else {
        match schedule_auto_renew(rt, handle, *timeout, sid, &event_url) {
            Ok(id) => Some(id),
            Err(e) => {
                if let Some(at) = client.subscriptions.iter().position(|s| s.sid == sid) {
                    client.subscriptions.remove(at);
                }
                return Err(e.into());
            }
        }
    };
    let sub = client
        .subscriptions
        .iter_mut()
        .find(|s| s.sid == sid)
        .ok_or(UpnpError::InvalidSid)?;
    sub.actual_sid = new_actual;
    sub.renew_timer = renew_timer;
    Ok(())
}

/// Unsubscribe by our SID. The record and its timer go away regardless of
/// what the publisher answers; a non-200 surfaces after the cleanup.
pub(crate) fn unsubscribe(rt: &RuntimeInner, handle: HandleId, sid: &str) -> Result<()> {
    let (actual_sid, event_url, timer) = {
        let handles = rt.handles.lock();
        let client = handles.client(handle)?;
        let sub = client
            .subscriptions
            .iter()
            .find(|s| s.sid == sid)
            .ok_or(UpnpError::InvalidSid)?;
        (sub.actual_sid.clone(), sub.event_url.clone(), sub.renew_timer)
    };

    let result = gena_http_unsubscribe(rt, &event_url, &actual_sid);

    if let Some(timer) = timer {
        rt.timer.remove(timer);
    }
    let mut handles = rt.handles.lock();
    if let Ok(client) = handles.client_mut(handle) {
        if let Some(at) = client.subscriptions.iter().position(|s| s.sid == sid) {
            client.subscriptions.remove(at);
        }
    }
    result
}

/// Drop every subscription on the handle, unsubscribing best-effort.
/// Used when the client handle unregisters.
pub(crate) fn unsubscribe_all(rt: &RuntimeInner, handle: HandleId) {
    loop {
        let sub = {
            let mut handles = rt.handles.lock();
            let Ok(client) = handles.client_mut(handle) else {
                return;
            };
            if client.subscriptions.is_empty() {
                return;
            }
            client.subscriptions.remove(0)
        };
        if let Some(timer) = sub.renew_timer {
            rt.timer.remove(timer);
        }
        if let Err(e) = gena_http_unsubscribe(rt, &sub.event_url, &sub.actual_sid) {
            log::warn!("gena: unsubscribe of {} failed: {e}", sub.sid);
        }
    }
}

fn gena_http_unsubscribe(rt: &RuntimeInner, url_str: &str, actual_sid: &str) -> Result<()> {
    let url = Url::parse(url_str).map_err(|_| UpnpError::InvalidArgument("bad publisher URL"))?;
    let headers = vec![
        ("SID".to_string(), actual_sid.to_string()),
        ("USER-AGENT".to_string(), server_string("")),
    ];
    let response = rt.http.request("UNSUBSCRIBE", url.as_str(), &headers)?;
    if response.status != 200 {
        return Err(UpnpError::UnsubscribeUnaccepted(response.status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_header_parsing() {
        assert_eq!(parse_timeout_header("Second-1800"), Some(1800));
        assert_eq!(parse_timeout_header("second-300"), Some(300));
        assert_eq!(parse_timeout_header("Second-infinite"), Some(TIMEOUT_INFINITE));
        assert_eq!(parse_timeout_header("SECOND-INFINITE"), Some(TIMEOUT_INFINITE));
        assert_eq!(parse_timeout_header("1800"), None);
        assert_eq!(parse_timeout_header("Second--5"), None);
    }
}
