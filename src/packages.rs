/// Packages known to need more address space than the default budget, with
/// the minimum budget in MB a worker should get before installing them.
const HEAVY_PACKAGES: &[(&str, u64)] = &[
    ("numpy", 1536),
    ("pandas", 2048),
    ("scipy", 1536),
    ("tensorflow", 4096),
    ("torch", 4096),
];

const MB: u64 = 1024 * 1024;

/// Static lookup of heavy packages. Only ever used to raise a budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageBudget;

impl PackageBudget {
    pub fn minimum_mb(&self, requirement: &str) -> Option<u64> {
        let name = package_name(requirement);
        HEAVY_PACKAGES
            .iter()
            .find(|(heavy, _)| *heavy == name)
            .map(|(_, mb)| *mb)
    }

    /// Largest minimum across `requirements`, in bytes.
    pub fn required_bytes<S: AsRef<str>>(&self, requirements: &[S]) -> Option<u64> {
        requirements
            .iter()
            .filter_map(|requirement| self.minimum_mb(requirement.as_ref()))
            .max()
            .map(|mb| mb.saturating_mul(MB))
    }
}

/// Normalized distribution name of a pip requirement string:
/// `"NumPy[extra]>=1.26; python_version>'3'"` becomes `"numpy"`.
pub fn package_name(requirement: &str) -> String {
    let end = requirement
        .find(|c: char| matches!(c, '[' | '=' | '<' | '>' | '!' | '~' | ';' | '@' | ' ' | '\t'))
        .unwrap_or(requirement.len());
    requirement[..end]
        .trim()
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_versions_extras_and_markers() {
        assert_eq!(package_name("numpy"), "numpy");
        assert_eq!(package_name("NumPy>=1.26"), "numpy");
        assert_eq!(package_name("pandas[performance]==2.2.0"), "pandas");
        assert_eq!(package_name("torch ; platform_system=='Linux'"), "torch");
        assert_eq!(package_name("typing_extensions~=4.0"), "typing-extensions");
    }

    #[test]
    fn heavy_packages_have_minimums() {
        let budget = PackageBudget;
        assert_eq!(budget.minimum_mb("numpy"), Some(1536));
        assert_eq!(budget.minimum_mb("torch==2.3"), Some(4096));
        assert_eq!(budget.minimum_mb("left-pad"), None);
    }

    #[test]
    fn required_bytes_takes_the_largest_match() {
        let budget = PackageBudget;
        assert_eq!(
            budget.required_bytes(&["numpy", "pandas", "requests"]),
            Some(2048 * MB)
        );
        assert_eq!(budget.required_bytes(&["requests"]), None);
        assert_eq!(budget.required_bytes::<&str>(&[]), None);
    }
}
