//! Container image reference validation

/// Characters that could enable injection when the reference reaches a shell
const SHELL_METACHARS: &[char] = &['`', '|', ';', '&', '$', '>', '<', '(', ')', '{', '}'];

const MAX_TAG_LEN: usize = 128;
const MIN_DIGEST_HEX: usize = 32;

/// Validate an image reference of the form
/// `[registry[:port]/]repository[:tag][@algorithm:hex]`.
pub fn validate_image(image: &str) -> Result<(), String> {
    if image.is_empty() {
        return Err("image cannot be empty".to_string());
    }
    if image.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("image '{image}' contains invalid characters"));
    }
    if image.chars().any(|c| SHELL_METACHARS.contains(&c)) {
        return Err(format!("image '{image}' contains shell metacharacters"));
    }

    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };
    if let Some(digest) = digest {
        validate_digest(digest)?;
    }

    let mut components: Vec<&str> = name.split('/').collect();
    let last = components.pop().unwrap_or_default();
    let (last, tag) = match last.split_once(':') {
        Some((repo, tag)) => (repo, Some(tag)),
        None => (last, None),
    };
    if let Some(tag) = tag {
        validate_tag(tag)?;
    }
    components.push(last);

    if components.len() > 1 && is_registry(components[0]) {
        validate_registry(components.remove(0))?;
    }
    for component in components {
        validate_component(component, image)?;
    }
    Ok(())
}

fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_registry(registry: &str) -> Result<(), String> {
    let (host, port) = match registry.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };
    let host_ok = !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if !host_ok {
        return Err(format!("registry '{registry}' is not a valid host"));
    }
    if let Some(port) = port {
        if port.parse::<u16>().map_or(true, |p| p == 0) {
            return Err(format!("registry port '{port}' is not valid"));
        }
    }
    Ok(())
}

fn validate_component(component: &str, image: &str) -> Result<(), String> {
    if component.is_empty() {
        return Err(format!("image '{image}' has an empty path component"));
    }
    if component.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(format!("repository '{component}' must be lowercase"));
    }
    let valid_chars = component
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    let is_separator = |c: char| matches!(c, '.' | '_' | '-');
    if !valid_chars
        || component.starts_with(is_separator)
        || component.ends_with(is_separator)
    {
        return Err(format!("repository component '{component}' is not valid"));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), String> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok || tag.len() > MAX_TAG_LEN {
        return Err(format!("tag '{tag}' is not valid"));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), String> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(format!("digest '{digest}' must be algorithm:hex"));
    };
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'));
    let hex_ok = hex.len() >= MIN_DIGEST_HEX && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !algorithm_ok || !hex_ok {
        return Err(format!("digest '{digest}' is not valid"));
    }
    Ok(())
}
