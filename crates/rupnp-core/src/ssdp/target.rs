//! USN / NT / ST decomposition and search-type classification.
//!
//! The recognized forms are:
//!
//! ```text
//! ssdp:all
//! upnp:rootdevice
//! uuid:device-UUID
//! uuid:device-UUID::upnp:rootdevice
//! uuid:device-UUID::urn:<domain>:device:<type>:<v>
//! uuid:device-UUID::urn:<domain>:service:<type>:<v>
//! urn:<domain>:device:<type>:<v>
//! urn:<domain>:service:<type>:<v>
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    All,
    RootDevice,
    DeviceUdn,
    DeviceType,
    Service,
}

/// Classify a USN/NT/ST string. Substring checks; precedence matters
/// (`:rootdevice` beats the `uuid:` prefix in compound USNs). `None` is
/// the unrecognized case.
pub fn classify(cmd: &str) -> Option<SearchType> {
    if cmd.contains(":all") {
        return Some(SearchType::All);
    }
    if cmd.contains(":rootdevice") {
        return Some(SearchType::RootDevice);
    }
    if cmd.contains("uuid:") {
        return Some(SearchType::DeviceUdn);
    }
    if cmd.contains("urn:") && cmd.contains(":device:") {
        return Some(SearchType::DeviceType);
    }
    if cmd.contains("urn:") && cmd.contains(":service:") {
        return Some(SearchType::Service);
    }
    None
}

/// The components extractable from a USN/NT/ST string. Fields are empty
/// when the corresponding component is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsnParts {
    pub udn: String,
    pub device_type: String,
    pub service_type: String,
}

/// Pull UDN, device type and service type out of `cmd` as available.
/// `None` when no recognizable component is present.
pub fn decompose_usn(cmd: &str) -> Option<UsnParts> {
    let mut parts = UsnParts::default();
    let mut found = false;

    if cmd.starts_with("uuid:") {
        parts.udn = match cmd.find("::") {
            Some(end) => cmd[..end].to_string(),
            None => cmd.to_string(),
        };
        found = true;
    }
    if let Some(urn) = cmd.find("urn:") {
        if cmd.contains(":service:") {
            parts.service_type = cmd[urn..].to_string();
            found = true;
        }
        if cmd.contains(":device:") {
            parts.device_type = cmd[urn..].to_string();
            found = true;
        }
    }
    found.then_some(parts)
}

/// Fully parsed search target: classification plus components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpEntity {
    pub request_type: SearchType,
    pub udn: String,
    pub device_type: String,
    pub service_type: String,
}

/// Classify and decompose in one step, the way inbound NT/ST headers are
/// consumed. `None` when the string matches no recognized target form.
pub fn parse_entity(cmd: &str) -> Option<SsdpEntity> {
    let request_type = classify(cmd)?;
    let parts = decompose_usn(cmd).unwrap_or_default();
    Some(SsdpEntity {
        request_type,
        udn: parts.udn,
        device_type: parts.device_type,
        service_type: parts.service_type,
    })
}

/// Integer version suffix of a `urn:...:<type>:<v>` string.
pub fn type_version(type_str: &str) -> Option<u32> {
    type_str.rsplit(':').next()?.parse().ok()
}

/// The type string without comparing the version suffix: byte prefix of
/// length `len - 2`, which is how versioned types have always been matched
/// on the wire (single-digit versions assumed).
pub fn same_type_ignoring_version(searched: &str, local: &str) -> bool {
    let n = searched.len().saturating_sub(2);
    local.len() >= n && searched[..n].eq_ignore_ascii_case(&local[..n])
}
