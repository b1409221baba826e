//! NOTIFY ingestion: validation, property-set parsing and dispatch.
//!
//! The host's web server hands over a parsed transaction (headers + body);
//! this module answers with the HTTP status to send back and, on success,
//! queues the `EventReceived` callback. The property set is read with a
//! small SAX-style pass over `quick-xml` events: every element closing
//! directly inside a `property` element contributes one name/value pair.

use std::collections::HashMap;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::events::{PropertyEvent, UpnpEvent};
use crate::runtime::RuntimeInner;
use crate::threadutil::JobPriority;

/// An inbound NOTIFY as delivered by the host's web server: header names
/// lower-cased by the server, body undecoded.
#[derive(Debug, Clone, Default)]
pub struct NotifyTransaction {
    pub headers: HashMap<String, String>,
    pub content_type: String,
    pub body: String,
}

impl NotifyTransaction {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Element name without its namespace prefix.
fn local_name(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    match name.rfind(':') {
        Some(at) => name[at + 1..].to_string(),
        None => name.into_owned(),
    }
}

/// Parse a `propertyset` body into name -> value, character data trimmed.
/// `None` on malformed XML.
pub fn parse_propertyset(xml: &str) -> Option<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut chardata = String::new();
    let mut props = HashMap::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(local_name(e.name().as_ref()));
            }
            Ok(Event::Empty(e)) => {
                // Self-closing element: same as start + end with no text.
                let name = local_name(e.name().as_ref());
                if path.last().map(String::as_str) == Some("property") {
                    props.insert(name, String::new());
                }
                chardata.clear();
            }
            Ok(Event::Text(t)) => {
                chardata.push_str(&t.unescape().ok()?);
            }
            Ok(Event::CData(t)) => {
                chardata.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                if path.len() >= 2 && path[path.len() - 2] == "property" {
                    props.insert(name, chardata.trim().to_string());
                }
                chardata.clear();
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    Some(props)
}

const HTTP_OK: u16 = 200;
const HTTP_BAD_REQUEST: u16 = 400;
const HTTP_PRECONDITION_FAILED: u16 = 412;

/// Process one NOTIFY. Returns the status the server should answer with:
/// 412 for unknown/missing SID or wrong NT/NTS, 400 for other malformed
/// requests, 200 with the callback queued otherwise.
pub(crate) fn process_notify(rt: &Arc<RuntimeInner>, transaction: &NotifyTransaction) -> u16 {
    let Some(peer_sid) = transaction.header("sid") else {
        return HTTP_PRECONDITION_FAILED;
    };
    let event_key: u32 = match transaction.header("seq").map(str::trim) {
        Some(seq) if !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()) => {
            match seq.parse() {
                Ok(v) => v,
                Err(_) => return HTTP_BAD_REQUEST,
            }
        }
        _ => return HTTP_BAD_REQUEST,
    };
    let (Some(nt), Some(nts)) = (transaction.header("nt"), transaction.header("nts")) else {
        return HTTP_BAD_REQUEST;
    };
    if nt != "upnp:event" || nts != "upnp:propchange" {
        return HTTP_PRECONDITION_FAILED;
    }
    if !transaction.content_type.to_ascii_lowercase().contains("xml")
        || transaction.body.is_empty()
    {
        return HTTP_BAD_REQUEST;
    }
    let Some(changed) = parse_propertyset(&transaction.body) else {
        return HTTP_BAD_REQUEST;
    };

    let mut handles = rt.handles.lock();
    let Some((_, client)) = handles.the_client() else {
        return HTTP_PRECONDITION_FAILED;
    };
    let mut found = client
        .subscriptions
        .iter()
        .find(|s| s.actual_sid == peer_sid)
        .map(|s| (s.sid.clone(), Arc::clone(&client.callback)));

    if found.is_none() {
        if event_key != 0 {
            return HTTP_PRECONDITION_FAILED;
        }
        // First-event race: the NOTIFY can beat the SUBSCRIBE response
        // handling. Let any in-flight subscribe publish its record, then
        // look again.
        drop(handles);
        let serializer = rt.subscribe_lock.lock();
        handles = rt.handles.lock();
        drop(serializer);
        let Some((_, client)) = handles.the_client() else {
            return HTTP_PRECONDITION_FAILED;
        };
        found = client
            .subscriptions
            .iter()
            .find(|s| s.actual_sid == peer_sid)
            .map(|s| (s.sid.clone(), Arc::clone(&client.callback)));
        if found.is_none() {
            return HTTP_PRECONDITION_FAILED;
        }
    }
    drop(handles);

    let (sid, callback) = found.expect("checked above");
    let event = PropertyEvent {
        sid,
        event_key,
        changed,
    };
    let queued = rt.pool.add_job(JobPriority::Med, move || {
        callback(&UpnpEvent::EventReceived(event));
    });
    if let Err(e) = queued {
        log::warn!("gena: dropping NOTIFY callback: {e}");
    }
    HTTP_OK
}
