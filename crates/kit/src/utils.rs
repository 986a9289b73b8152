//! Small shared helpers.

/// Sanitize `base` into a usable machine name and uniquify it against the
/// names already registered with VirtualBox.
pub(crate) fn generate_unique_vm_name(base: &str, existing: &[String]) -> String {
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let mut candidate = sanitized.clone();
    let mut counter = 1;
    while existing.contains(&candidate) {
        counter += 1;
        candidate = format!("{}-{}", sanitized, counter);
    }

    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_sanitized() {
        assert_eq!(generate_unique_vm_name("my vm!", &[]), "my-vm-");
        assert_eq!(generate_unique_vm_name("ubuntu64-base", &[]), "ubuntu64-base");
    }

    #[test]
    fn collisions_get_a_counter() {
        let existing = vec!["ubuntu64-base".to_string(), "ubuntu64-base-2".to_string()];
        assert_eq!(generate_unique_vm_name("ubuntu64-base", &existing), "ubuntu64-base-3");
    }
}
