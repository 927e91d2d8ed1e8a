//! Placeholder rendering for host names and join commands.

use crate::error::MutationError;

/// Linux `HOST_NAME_MAX`
pub const MAX_FQDN_LEN: usize = 64;

/// Replace `{key}` placeholders in one pass.
///
/// Values are never re-scanned, so a value containing braces cannot expand
/// into another placeholder. Unknown keys are left untouched.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find('}') {
            Some(end) => {
                let key = &tail[1..end];
                match vars.iter().find(|(k, _)| *k == key) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Build and validate the FQDN a VM is registered under.
///
/// `{name}`, `{namespace}` and `{domain}` are available in `template`.
pub fn target_fqdn(template: &str, name: &str, namespace: &str, domain: &str) -> Result<String, MutationError> {
    let fqdn = render(
        template,
        &[("name", name), ("namespace", namespace), ("domain", domain.trim_end_matches('.'))],
    );
    validate_fqdn(&fqdn)?;
    Ok(fqdn)
}

/// Reject names that FreeIPA or the guest would refuse.
pub fn validate_fqdn(fqdn: &str) -> Result<(), MutationError> {
    if fqdn.len() > MAX_FQDN_LEN {
        return Err(MutationError::InvalidHostname(format!(
            "Generated FQDN '{}' is {} chars. Max allowed is {}.",
            fqdn,
            fqdn.len(),
            MAX_FQDN_LEN
        )));
    }
    if !fqdn.contains('.') {
        return Err(MutationError::InvalidHostname(format!(
            "Generated FQDN '{}' has no domain part",
            fqdn
        )));
    }
    for label in fqdn.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid {
            return Err(MutationError::InvalidHostname(format!(
                "Generated FQDN '{}' is not a valid DNS name (label '{}')",
                fqdn, label
            )));
        }
    }
    Ok(())
}
