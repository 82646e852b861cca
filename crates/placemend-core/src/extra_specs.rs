//! Parsing of `resources*:` / `trait*:` extra-spec keys
//!
//! Flavors and device profile groups express resource and trait requests as
//! string keys of the form `<prefix><suffix>:<name>`, where the prefix is
//! `resources` or `trait` and the optional suffix names a request group
//! (`resources1:VGPU`, `trait_acc:CUSTOM_FPGA`). Keys that do not follow the
//! pattern (`hw:cpu_policy`, `accel:bitstream_id`) are not resource requests.

pub const RESOURCES_PREFIX: &str = "resources";
pub const TRAIT_PREFIX: &str = "trait";

const MAX_SUFFIX_LEN: usize = 64;

/// Which family of request an extra-spec key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecPrefix {
    Resources,
    Trait,
}

/// A parsed extra-spec key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraSpecKey<'a> {
    pub prefix: SpecPrefix,
    /// Request group suffix, empty for the unsuffixed group
    pub suffix: &'a str,
    /// Resource class or trait name
    pub name: &'a str,
}

impl ExtraSpecKey<'_> {
    pub fn is_unsuffixed(&self) -> bool {
        self.suffix.is_empty()
    }
}

/// Parse a key, returning `None` when it is not a resource or trait request
pub fn parse_key(key: &str) -> Option<ExtraSpecKey<'_>> {
    let (head, name) = key.split_once(':')?;
    let (prefix, suffix) = if let Some(rest) = head.strip_prefix(RESOURCES_PREFIX) {
        (SpecPrefix::Resources, rest)
    } else if let Some(rest) = head.strip_prefix(TRAIT_PREFIX) {
        (SpecPrefix::Trait, rest)
    } else {
        return None;
    };

    let valid_suffix = suffix.len() <= MAX_SUFFIX_LEN
        && suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_suffix || name.is_empty() {
        return None;
    }

    Some(ExtraSpecKey {
        prefix,
        suffix,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unsuffixed_resource() {
        let key = parse_key("resources:VGPU").unwrap();
        assert_eq!(key.prefix, SpecPrefix::Resources);
        assert!(key.is_unsuffixed());
        assert_eq!(key.name, "VGPU");
    }

    #[test]
    fn test_parse_suffixed_trait() {
        let key = parse_key("trait_acc:CUSTOM_INTEL_PAC_ARRIA10").unwrap();
        assert_eq!(key.prefix, SpecPrefix::Trait);
        assert_eq!(key.suffix, "_acc");
        assert_eq!(key.name, "CUSTOM_INTEL_PAC_ARRIA10");

        let key = parse_key("resources1:CUSTOM_ACCELERATOR_FPGA").unwrap();
        assert_eq!(key.suffix, "1");
    }

    #[test]
    fn test_non_request_keys() {
        assert!(parse_key("hw:cpu_policy").is_none());
        assert!(parse_key("accel:bitstream_id").is_none());
        assert!(parse_key("resources").is_none());
        assert!(parse_key("resources$:VCPU").is_none());
        assert!(parse_key("resources:").is_none());
    }
}
