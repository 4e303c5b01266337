use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Visual theme applied to figures before user code runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    /// Map the host's per-execution dark mode flag to a theme
    pub fn from_dark_mode(is_dark: bool) -> Self {
        if is_dark {
            Theme::Dark
        } else {
            Theme::Light
        }
    }

    pub fn is_dark(&self) -> bool {
        matches!(self, Theme::Dark)
    }

    /// Style name understood by matplotlib's `plt.style.use`
    pub fn style_name(&self) -> &'static str {
        match self {
            Theme::Light => "default",
            Theme::Dark => "dark_background",
        }
    }
}

/// Raster encoding used for captured figures
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Png,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
        }
    }

    /// Format name passed to the plotting library's save call
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
        }
    }
}

/// How the figure's bounding box is computed when rendering
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BBoxMode {
    /// Crop to the extent of the drawn content
    #[default]
    Tight,
    /// Use the full figure canvas
    Full,
}

/// Settings for the show interceptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CaptureSettings {
    pub format: ImageFormat,
    pub bbox: BBoxMode,
}

/// Security profile for Python execution
/// Determines the level of restrictions applied to code execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProfile {
    /// No import restrictions
    /// WARNING: Only use for trusted code or in isolated environments
    Yolo,

    /// Blocks known dangerous modules (subprocess, socket, etc.)
    #[default]
    Blacklist,

    /// Only allows plotting and data science modules
    DataScience,

    /// Data science whitelist + tight resource limits
    Strict,
}

impl SecurityProfile {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolo" => Some(Self::Yolo),
            "blacklist" | "balanced" => Some(Self::Blacklist),
            "data_science" | "data-science" => Some(Self::DataScience),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    /// Convert profile to import policy
    pub fn to_import_policy(&self) -> ImportPolicy {
        match self {
            SecurityProfile::Yolo => ImportPolicy::Blacklist(HashSet::new()), // Empty blacklist = allow all
            SecurityProfile::Blacklist => ImportPolicy::default(),
            SecurityProfile::DataScience | SecurityProfile::Strict => {
                ImportPolicy::data_science_whitelist()
            }
        }
    }

    /// Get resource limits for this profile
    pub fn resource_limits(&self) -> ResourceLimits {
        match self {
            SecurityProfile::Yolo => ResourceLimits {
                memory_mb: 8192,
                cpu_seconds: 300,
                max_processes: 50,
                max_threads: 16,
            },
            SecurityProfile::Blacklist | SecurityProfile::DataScience => {
                ResourceLimits::default()
            }
            SecurityProfile::Strict => ResourceLimits {
                memory_mb: 1024,
                cpu_seconds: 10,
                max_processes: 1,
                max_threads: 2,
            },
        }
    }
}

/// Resource limits for Python execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum memory in MB
    pub memory_mb: usize,
    /// Maximum CPU time in seconds
    pub cpu_seconds: u64,
    /// Maximum number of processes
    pub max_processes: u64,
    /// Maximum number of threads for scientific libraries
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_seconds: 30,
            max_processes: 10,
            max_threads: 4,
        }
    }
}

/// Import control policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportPolicy {
    /// Block specific modules
    Blacklist(HashSet<String>),
    /// Only allow specific modules
    Whitelist(HashSet<String>),
}

impl Default for ImportPolicy {
    fn default() -> Self {
        let blacklist = [
            "subprocess",
            "multiprocessing",
            "socket",
            "urllib",
            "requests",
            "ctypes",
            "pty",
            "fcntl",
            "resource",
            "shutil",
            "webbrowser",
            "antigravity",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        ImportPolicy::Blacklist(blacklist)
    }
}

impl ImportPolicy {
    /// Check if an import is allowed
    pub fn is_allowed(&self, module: &str) -> bool {
        let root_module = module.split('.').next().unwrap_or(module);

        match self {
            ImportPolicy::Blacklist(blacklist) => !blacklist.contains(root_module),
            ImportPolicy::Whitelist(whitelist) => whitelist.contains(root_module),
        }
    }

    /// Whitelist for plotting and numeric work
    pub fn data_science_whitelist() -> Self {
        let whitelist = [
            // Plotting and numeric packages
            "numpy",
            "pandas",
            "matplotlib",
            "scipy",
            "sympy",
            "mpmath",
            "PIL",
            // Needed by the capture preamble and result wrapper
            "builtins",
            "sys",
            "io",
            "base64",
            "json",
            "inspect",
            // Standard library commonly used alongside plots
            "math",
            "cmath",
            "random",
            "statistics",
            "datetime",
            "time",
            "collections",
            "itertools",
            "functools",
            "operator",
            "fractions",
            "decimal",
            "numbers",
            "string",
            "re",
            "textwrap",
            "typing",
            "dataclasses",
            "enum",
            "copy",
            "abc",
            "contextlib",
            "warnings",
            "traceback",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        ImportPolicy::Whitelist(whitelist)
    }

    /// Python set literal for the policy's module names, in sorted order
    pub(crate) fn python_set_literal(&self) -> String {
        let names = match self {
            ImportPolicy::Blacklist(names) | ImportPolicy::Whitelist(names) => names,
        };
        if names.is_empty() {
            return "set()".to_string();
        }
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        format!(
            "{{{}}}",
            sorted
                .iter()
                .map(|s| format!("'{}'", s))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
