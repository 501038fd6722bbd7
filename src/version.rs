/// Whether a sql-server at `version` implements
/// `dolt_cluster_transition_to_standby`, which first shipped in 1.6.0.
pub fn supports_transition_to_standby(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        return false;
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        match part.parse() {
            Ok(value) => *slot = value,
            Err(_) => return false,
        }
    }
    match numbers[0] {
        0 => false,
        1 => numbers[1] > 5,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_on_one_dot_six() {
        assert!(!supports_transition_to_standby("0.75.2"));
        assert!(!supports_transition_to_standby("1.5.0"));
        assert!(!supports_transition_to_standby("1.5.99"));
        assert!(supports_transition_to_standby("1.6.0"));
        assert!(supports_transition_to_standby("1.32.4"));
        assert!(supports_transition_to_standby("2.0.0"));
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!(!supports_transition_to_standby(""));
        assert!(!supports_transition_to_standby("1.6"));
        assert!(!supports_transition_to_standby("1.6.0.1"));
        assert!(!supports_transition_to_standby("1.6.0-rc1"));
        assert!(!supports_transition_to_standby("v1.6.0"));
    }
}
