use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Packages the worker knows how to provide
pub const KNOWN_PACKAGES: &[&str] = &["numpy", "matplotlib", "sympy", "scipy", "pandas", "pillow"];

static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bimport\s+([^\n#]+)").expect("invalid import regex"));

static FROM_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bfrom\s+([\w.]+)\s+import\s+").expect("invalid from-import regex")
});

static ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+as\s+").expect("invalid alias regex"));

/// Map an imported module path to the package that provides it
pub fn package_for_module(module: &str) -> Option<&'static str> {
    let root = module.split('.').next().unwrap_or(module).trim();
    let package = if root.eq_ignore_ascii_case("pil") {
        "pillow"
    } else {
        root
    };
    KNOWN_PACKAGES.iter().copied().find(|known| *known == package)
}

/// Known packages imported by `code`, sorted by name.
///
/// This is a textual scan, not a parse: imports inside strings count too.
pub fn detect_required_packages(code: &str) -> Vec<&'static str> {
    let mut found = BTreeSet::new();

    for caps in IMPORT_RE.captures_iter(code) {
        for segment in caps[1].split(',') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let name = ALIAS_RE.split(segment).next().unwrap_or(segment).trim();
            if let Some(package) = package_for_module(name) {
                found.insert(package);
            }
        }
    }

    for caps in FROM_IMPORT_RE.captures_iter(code) {
        if let Some(package) = package_for_module(&caps[1]) {
            found.insert(package);
        }
    }

    found.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_plain_and_aliased_imports() {
        let code = "import numpy as np\nimport matplotlib.pyplot as plt, sympy\n";
        assert_eq!(
            detect_required_packages(code),
            vec!["matplotlib", "numpy", "sympy"]
        );
    }

    #[test]
    fn test_from_imports_and_pil_mapping() {
        let code = "from PIL import Image\nfrom scipy.stats import norm\n";
        assert_eq!(detect_required_packages(code), vec!["pillow", "scipy"]);
    }

    #[test]
    fn test_ignores_unknown_modules_and_comments() {
        let code = "import os\nimport json  # numpy later\nfrom collections import deque\n";
        assert!(detect_required_packages(code).is_empty());
    }

    #[test]
    fn test_package_for_module() {
        assert_eq!(package_for_module("pandas.core.frame"), Some("pandas"));
        assert_eq!(package_for_module("requests"), None);
    }
}
