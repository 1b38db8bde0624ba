use crate::error::{ProxyError, ProxyResult};

/// Verify that required external binaries exist before any privileged work.
pub fn check_dependencies(required: &[&str]) -> ProxyResult<()> {
    let missing: Vec<&str> = required
        .iter()
        .filter(|bin| which::which(bin).is_err())
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProxyError::Dependency(format!(
            "please install: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_binaries_pass() {
        check_dependencies(&["sh"]).unwrap();
    }

    #[test]
    fn missing_binary_is_reported_by_name() {
        let err = check_dependencies(&["sh", "no-such-binary-470b"]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no-such-binary-470b"), "got: {message}");
        assert!(!message.contains("sh,"), "got: {message}");
    }
}
