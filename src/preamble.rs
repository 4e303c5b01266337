//! Python source that realises the show interceptor inside a Python process.
//!
//! A long-lived interpreter runs [`driver_script`], which executes framed
//! scripts sent over stdin in the `__main__` namespace. The first frame is
//! the [`boot_script`] (matplotlib preamble and import control); each cell
//! then sends a [`cell_script`] (setup call and wrapped user code). After
//! every frame the driver prints the frame's result as one JSON line between
//! the marker lines returned by [`output_markers`].

use crate::config::{BBoxMode, CaptureSettings, ImportPolicy, Theme};
use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const OUTPUT_JSON_START: &str = "OUTPUT_JSON_START";
pub const OUTPUT_JSON_END: &str = "OUTPUT_JSON_END";

/// Argument the driver is started with, after `-c <driver>`
pub const DRIVER_ARG: &str = "--figcap-serve";

/// Start and end marker lines for the frame tagged `nonce`
pub fn output_markers(nonce: &str) -> (String, String) {
    (
        format!("{} {}", OUTPUT_JSON_START, nonce),
        format!("{} {}", OUTPUT_JSON_END, nonce),
    )
}

/// Frame loop run with `python -c`.
///
/// Each frame is a nonce line, a byte length line and that many bytes of
/// UTF-8 script. A script reports back by binding `_figcap_result`; an
/// exception escaping the script is reported as `{"error": ...}`.
pub fn driver_script() -> String {
    format!(
        r#"
def _figcap_serve():
    import json
    import sys
    channel = sys.stdout
    inbox = sys.stdin.buffer
    scope = sys.modules['__main__'].__dict__
    while True:
        nonce = inbox.readline()
        if not nonce:
            return
        nonce = nonce.decode('ascii').strip()
        size = int(inbox.readline())
        script = inbox.read(size).decode('utf-8')
        scope.pop('_figcap_result', None)
        try:
            exec(compile(script, '<figcap>', 'exec'), scope)
            result = scope.pop('_figcap_result', None) or {{}}
        except BaseException as e:
            result = {{"error": f"{{type(e).__name__}}: {{e}}"}}
        channel.write("\n{start} " + nonce + "\n")
        channel.write(json.dumps(result, default=str) + "\n")
        channel.write("{end} " + nonce + "\n")
        channel.flush()

_figcap_serve()
"#,
        start = OUTPUT_JSON_START,
        end = OUTPUT_JSON_END,
    )
}

/// Backend selection, theme and show hook definitions.
///
/// Safe to run more than once in the same interpreter: the image and
/// diagnostics lists are only created when absent.
pub fn matplotlib_preamble(settings: &CaptureSettings) -> String {
    let bbox = match settings.bbox {
        BBoxMode::Tight => "'tight'",
        BBoxMode::Full => "None",
    };
    let prefix = format!("data:{};base64,", settings.format.mime_type());

    format!(
        r#"
import base64
import inspect
import io
import json
import sys

try:
    import matplotlib
    matplotlib.use("Agg")
    import matplotlib.pyplot as plt
except Exception:
    plt = None

if '_figcap_images' not in globals():
    _figcap_images = []
if '_figcap_diagnostics' not in globals():
    _figcap_diagnostics = []

def _figcap_note(stage, err):
    _figcap_diagnostics.append({{"stage": stage, "message": f"{{type(err).__name__}}: {{err}}"}})

def _figcap_apply_theme(is_dark):
    if plt is None:
        return
    style = '{dark}' if is_dark else '{light}'
    try:
        plt.style.use(style)
    except Exception as e:
        _figcap_note("theme", e)

def _figcap_show_capture(*args, **kwargs):
    data = b""
    with io.BytesIO() as buf:
        try:
            if plt is not None:
                plt.savefig(buf, format='{format}', bbox_inches={bbox})
            buf.seek(0)
            data = buf.read()
        except Exception as e:
            _figcap_note("render", e)
            data = b""
    _figcap_images.append('{prefix}' + base64.b64encode(data).decode('ascii'))
    if plt is not None:
        try:
            plt.close()
        except Exception as e:
            _figcap_note("release", e)

def _figcap_install_show_hook():
    if plt is not None and plt.show is not _figcap_show_capture:
        plt.show = _figcap_show_capture
"#,
        dark = Theme::Dark.style_name(),
        light = Theme::Light.style_name(),
        format = settings.format.extension(),
        bbox = bbox,
        prefix = prefix,
    )
}

/// Import guard for user code. Imports made from inside already-loaded
/// libraries are let through; only `__main__` is checked.
pub fn import_control(policy: &ImportPolicy) -> String {
    let check = match policy {
        ImportPolicy::Blacklist(blacklist) if blacklist.is_empty() => return String::new(),
        ImportPolicy::Blacklist(_) => {
            r#"    if root_module in _FIGCAP_MODULES:
        raise ImportError(f"Module '{root_module}' is blacklisted for safety")"#
        }
        ImportPolicy::Whitelist(_) => {
            r#"    if root_module not in _FIGCAP_MODULES and root_module != 'builtins':
        raise ImportError(f"Module '{root_module}' is not in whitelist")"#
        }
    };

    format!(
        r#"
import builtins

_FIGCAP_MODULES = {modules}

if '_figcap_original_import' not in globals():
    _figcap_original_import = builtins.__import__

def _figcap_safe_import(name, globals=None, locals=None, fromlist=(), level=0):
    # Relative imports stay within an already-imported package
    if level > 0:
        return _figcap_original_import(name, globals, locals, fromlist, level)
    if (globals or {{}}).get('__name__', '__main__') != '__main__':
        return _figcap_original_import(name, globals, locals, fromlist, level)
    root_module = name.split('.')[0]
{check}
    return _figcap_original_import(name, globals, locals, fromlist, level)

builtins.__import__ = _figcap_safe_import
"#,
        modules = policy.python_set_literal(),
        check = check,
    )
}

/// Reset captured images, install the show hook and apply the theme
pub fn setup_call(theme: Theme) -> String {
    format!(
        r#"
_figcap_images = []
_figcap_diagnostics = []
try:
    _figcap_install_show_hook()
except Exception as e:
    _figcap_note("hook", e)
try:
    _figcap_apply_theme({is_dark})
except Exception as e:
    _figcap_note("theme", e)
"#,
        is_dark = if theme.is_dark() { "True" } else { "False" },
    )
}

/// Run `code` with stdio captured and bind the structured result to
/// `_figcap_result`.
///
/// The result is built in `finally`, so output and images survive
/// `sys.exit()` and other `BaseException`s. `SystemExit` with code `0` or
/// `None` is a clean exit. `variables` are global names whose `repr` is
/// reported back; names that are not Python identifiers are dropped.
pub fn wrap_user_code(code: &str, variables: &[String]) -> String {
    let names = variables
        .iter()
        .filter(|name| is_identifier(name))
        .map(|name| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
_figcap_source = base64.b64decode('{source}').decode('utf-8')
_figcap_stdout = io.StringIO()
_figcap_stderr = io.StringIO()
_figcap_saved_stdio = (sys.stdin, sys.stdout, sys.stderr)
sys.stdin, sys.stdout, sys.stderr = io.StringIO(), _figcap_stdout, _figcap_stderr
_figcap_error = None

try:
    exec(compile(_figcap_source, '<cell>', 'exec'), globals())
except SystemExit as e:
    if e.code not in (None, 0):
        _figcap_error = f"SystemExit: {{e.code}}"
except BaseException as e:
    _figcap_error = f"{{type(e).__name__}}: {{e}}"
finally:
    sys.stdin, sys.stdout, sys.stderr = _figcap_saved_stdio
    _figcap_result = {{
        "stdout": _figcap_stdout.getvalue(),
        "stderr": _figcap_stderr.getvalue(),
        "error": _figcap_error,
        "images": list(_figcap_images),
        "diagnostics": list(_figcap_diagnostics),
        "functions": [
            n for n, o in list(globals().items())
            if inspect.isfunction(o) and not n.startswith('_figcap_')
        ],
        "variables": {{n: repr(globals().get(n)) for n in [{names}]}},
    }}
"#,
        source = STANDARD.encode(code),
        names = names,
    )
}

/// First frame sent to a fresh interpreter
pub fn boot_script(settings: &CaptureSettings, policy: &ImportPolicy) -> String {
    let mut script = matplotlib_preamble(settings);
    script.push_str(&import_control(policy));
    script
}

/// Frame sent for one cell
pub fn cell_script(theme: Theme, code: &str, variables: &[String]) -> String {
    let mut script = setup_call(theme);
    script.push_str(&wrap_user_code(code, variables));
    script
}

/// Byte frame for the driver: nonce line, length line, script bytes
pub fn frame(nonce: &str, script: &str) -> Vec<u8> {
    let mut bytes = format!("{}\n{}\n", nonce, script.len()).into_bytes();
    bytes.extend_from_slice(script.as_bytes());
    bytes
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProfile;

    #[test]
    fn test_preamble_selects_agg_and_tight_png() {
        let preamble = matplotlib_preamble(&CaptureSettings::default());
        assert!(preamble.contains(r#"matplotlib.use("Agg")"#));
        assert!(preamble.contains("plt.savefig(buf, format='png', bbox_inches='tight')"));
        assert!(preamble.contains("'data:image/png;base64,' + base64.b64encode"));
        assert!(preamble.contains("plt = None"));
    }

    #[test]
    fn test_preamble_guards_globals_and_hook() {
        let preamble = matplotlib_preamble(&CaptureSettings::default());
        assert!(preamble.contains("if '_figcap_images' not in globals():"));
        assert!(preamble.contains("plt.show is not _figcap_show_capture"));
        assert!(preamble.contains("style = 'dark_background' if is_dark else 'default'"));
    }

    #[test]
    fn test_full_bbox() {
        let settings = CaptureSettings {
            bbox: BBoxMode::Full,
            ..Default::default()
        };
        assert!(matplotlib_preamble(&settings).contains("bbox_inches=None"));
    }

    #[test]
    fn test_setup_call_theme_flag() {
        assert!(setup_call(Theme::Dark).contains("_figcap_apply_theme(True)"));
        assert!(setup_call(Theme::Light).contains("_figcap_apply_theme(False)"));
        assert!(setup_call(Theme::Light).contains("_figcap_images = []"));
    }

    #[test]
    fn test_setup_call_labels_hook_and_theme_separately() {
        let setup = setup_call(Theme::Dark);
        let hook = setup.find("_figcap_install_show_hook()").unwrap();
        let hook_note = setup.find(r#"_figcap_note("hook", e)"#).unwrap();
        let theme = setup.find("_figcap_apply_theme(True)").unwrap();
        let theme_note = setup.find(r#"_figcap_note("theme", e)"#).unwrap();
        assert!(hook < hook_note && hook_note < theme && theme < theme_note);
    }

    #[test]
    fn test_import_control_variants() {
        assert!(import_control(&SecurityProfile::Yolo.to_import_policy()).is_empty());

        let blacklist = import_control(&ImportPolicy::default());
        assert!(blacklist.contains("'subprocess'"));
        assert!(blacklist.contains("blacklisted for safety"));
        assert!(blacklist.contains("if '_figcap_original_import' not in globals():"));

        let whitelist = import_control(&ImportPolicy::data_science_whitelist());
        assert!(whitelist.contains("'matplotlib'"));
        assert!(whitelist.contains("not in whitelist"));
    }

    #[test]
    fn test_wrap_encodes_code_and_filters_variables() {
        let code = "s = '''\nkeep\n  indent'''\nplt.show()";
        let wrapped = wrap_user_code(
            code,
            &["x".to_string(), "bad name".to_string(), "_y2".to_string()],
        );
        assert!(wrapped.contains(&format!("b64decode('{}')", STANDARD.encode(code))));
        assert!(wrapped.contains("for n in ['x', '_y2']"));
        assert!(wrapped.contains("except BaseException as e:"));
        assert!(!wrapped.contains(OUTPUT_JSON_START));
    }

    #[test]
    fn test_boot_and_cell_scripts_order_parts() {
        let boot = boot_script(&CaptureSettings::default(), &ImportPolicy::default());
        let preamble = boot.find("def _figcap_show_capture").unwrap();
        let guard = boot.find("builtins.__import__ = _figcap_safe_import").unwrap();
        assert!(preamble < guard);

        let cell = cell_script(Theme::Dark, "print('hi')", &[]);
        let setup = cell.find("_figcap_apply_theme(True)").unwrap();
        let user = cell.find("_figcap_source = ").unwrap();
        assert!(setup < user);
    }

    #[test]
    fn test_frame_counts_bytes_not_chars() {
        let bytes = frame("n1", "print('é')");
        assert_eq!(bytes, "n1\n11\nprint('é')".as_bytes());
    }

    #[test]
    fn test_markers_carry_nonce() {
        let (start, end) = output_markers("abc");
        assert_eq!(start, "OUTPUT_JSON_START abc");
        assert_eq!(end, "OUTPUT_JSON_END abc");
        assert!(driver_script().contains(r#"channel.write("\nOUTPUT_JSON_START " + nonce + "\n")"#));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("fig_1"));
        assert!(!is_identifier("1fig"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a.b"));
    }
}
