//! `--registries` flag: comma-separated `host:port` entries.

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{value}' - {reason}")]
pub struct RegistryParseError {
    pub value: String,
    pub reason: String,
}

/// Split and validate the flag. An empty flag means no registries.
pub fn parse_registries(flag: &str) -> Result<Vec<String>, RegistryParseError> {
    if flag.trim().is_empty() {
        return Ok(Vec::new());
    }
    flag.split(',').map(|value| parse_entry(value.trim())).collect()
}

fn parse_entry(value: &str) -> Result<String, RegistryParseError> {
    let fail = |reason: &str| RegistryParseError {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    // A non-special scheme keeps the authority as written, port included.
    let url = Url::parse(&format!("registry://{value}")).map_err(|e| fail(&e.to_string()))?;

    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| fail("missing host"))?;
    let port = url.port().ok_or_else(|| fail("missing port"))?;
    if !url.username().is_empty() || url.password().is_some() {
        return Err(fail("credentials are not allowed"));
    }
    if !url.path().is_empty() || url.query().is_some() || url.fragment().is_some() {
        return Err(fail("expected host:port only"));
    }
    Ok(format!("{host}:{port}"))
}
