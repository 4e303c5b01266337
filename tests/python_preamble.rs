use figcap::preamble::{matplotlib_preamble, setup_call, wrap_user_code};
use figcap::{CaptureDiagnostic, CaptureSettings, CaptureStage, DataUri, Theme, PNG_DATA_URI_PREFIX};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

fn python() -> Option<PathBuf> {
    which::which("python3").or_else(|_| which::which("python")).ok()
}

#[derive(Debug, Deserialize)]
struct CellResult {
    stdout: String,
    error: Option<String>,
    images: Vec<String>,
    diagnostics: Vec<CaptureDiagnostic>,
    variables: std::collections::BTreeMap<String, String>,
}

/// Run the preamble with `plt` replaced by `stub`, then one cell, and read
/// back the cell's result
fn run_with_stub(python: &PathBuf, stub: &str, theme: Theme, code: &str, variables: &[&str]) -> CellResult {
    let variables: Vec<String> = variables.iter().map(|v| v.to_string()).collect();
    let mut script = matplotlib_preamble(&CaptureSettings::default());
    script.push_str(stub);
    script.push_str(&setup_call(theme));
    script.push_str(&wrap_user_code(code, &variables));
    script.push_str("\nprint(json.dumps(_figcap_result))\n");

    let mut child = Command::new(python)
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(script.as_bytes()).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "python failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn stages(result: &CellResult) -> Vec<CaptureStage> {
    result.diagnostics.iter().map(|d| d.stage).collect()
}

const FAILING_PLOT: &str = r#"
class _FailingStyle:
    def use(self, name):
        raise OSError(f"'{name}' not found in the style library")

class _FailingPlot:
    style = _FailingStyle()
    def show(self, *args, **kwargs):
        raise RuntimeError("no display")
    def savefig(self, buf, **kwargs):
        buf.write(b"partial")
        raise RuntimeError("savefig failed")
    def close(self):
        raise RuntimeError("close failed")

plt = _FailingPlot()
"#;

const WORKING_PLOT: &str = r#"
class _Style:
    used = []
    def use(self, name):
        self.used.append(name)

class _WorkingPlot:
    style = _Style()
    drawn = 0
    closed = 0
    def show(self, *args, **kwargs):
        raise RuntimeError("no display")
    def savefig(self, buf, format=None, bbox_inches=None):
        _WorkingPlot.drawn += 1
        buf.write(b"\x89PNG" + bytes([_WorkingPlot.drawn]) + (bbox_inches or "").encode())
    def close(self):
        _WorkingPlot.closed += 1

plt = _WorkingPlot()
"#;

const SEALED_PLOT: &str = r#"
class _Style:
    def use(self, name):
        pass

class _SealedPlot:
    style = _Style()
    def __setattr__(self, name, value):
        raise AttributeError(f"cannot rebind {name}")
    def show(self, *args, **kwargs):
        pass

plt = _SealedPlot()
"#;

#[test]
fn test_failures_are_absorbed_with_one_entry_per_show() {
    let Some(python) = python() else {
        eprintln!("skipping: python not found");
        return;
    };

    let result = run_with_stub(&python, FAILING_PLOT, Theme::Dark, "plt.show()\nprint('after')", &[]);

    assert_eq!(result.error, None);
    assert_eq!(result.stdout, "after\n");
    // Partial output from the failed render is discarded
    assert_eq!(result.images, vec![PNG_DATA_URI_PREFIX.to_string()]);
    assert_eq!(
        stages(&result),
        vec![CaptureStage::Theme, CaptureStage::Render, CaptureStage::Release]
    );
    assert!(result.diagnostics[0].message.contains("dark_background"));
}

#[test]
fn test_each_show_renders_tight_png_and_closes() {
    let Some(python) = python() else {
        eprintln!("skipping: python not found");
        return;
    };

    let result = run_with_stub(
        &python,
        WORKING_PLOT,
        Theme::Light,
        "plt.show()\nplt.show()\nclosed = plt.closed\nstyles = plt.style.used",
        &["closed", "styles"],
    );

    assert!(result.diagnostics.is_empty());
    assert_eq!(result.images.len(), 2);
    for (i, uri) in result.images.iter().enumerate() {
        let bytes = DataUri::parse(uri).unwrap().decode().unwrap();
        let mut expected = b"\x89PNG".to_vec();
        expected.push(i as u8 + 1);
        expected.extend_from_slice(b"tight");
        assert_eq!(bytes, expected);
    }
    assert_eq!(result.variables["closed"], "2");
    assert_eq!(result.variables["styles"], "['default']");
}

#[test]
fn test_hook_failure_is_labelled_hook() {
    let Some(python) = python() else {
        eprintln!("skipping: python not found");
        return;
    };

    let result = run_with_stub(&python, SEALED_PLOT, Theme::Dark, "plt.show()", &[]);

    assert_eq!(stages(&result), vec![CaptureStage::Hook]);
    assert!(result.diagnostics[0].message.starts_with("AttributeError"));
    // The original show ran, so nothing was captured
    assert!(result.images.is_empty());
}

#[test]
fn test_missing_plotting_library_still_appends_entry() {
    let Some(python) = python() else {
        eprintln!("skipping: python not found");
        return;
    };

    let result = run_with_stub(
        &python,
        "\nplt = None\n",
        Theme::Dark,
        "_figcap_show_capture()\n_figcap_show_capture()",
        &[],
    );

    assert!(result.diagnostics.is_empty());
    assert_eq!(
        result.images,
        vec![PNG_DATA_URI_PREFIX.to_string(), PNG_DATA_URI_PREFIX.to_string()]
    );
}

#[test]
fn test_sys_exit_inside_cell_still_reports() {
    let Some(python) = python() else {
        eprintln!("skipping: python not found");
        return;
    };

    let result = run_with_stub(
        &python,
        WORKING_PLOT,
        Theme::Light,
        "print('hello')\nplt.show()\nimport sys\nsys.exit()",
        &[],
    );

    assert_eq!(result.error, None);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.images.len(), 1);
}
