//! Compiler and runtime option handling.
//!
//! Options arrive as a `name=value` string, comma or semicolon
//! separated. Compile options take effect for the next compile; runtime
//! options (stack sizes) are only legal while the runtime is not yet
//! initialized and are surfaced to the embedder through
//! [`OptionOutcome::Runtime`].

use crate::error::{CompileErrorKind, ErrorFormat};

/// Local variable placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalsMode {
    /// Prefer registers, fall back to the stack.
    #[default]
    Auto,
    /// Force every local onto the stack.
    Stack,
}

/// Garbage collector logging detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcLog {
    /// No GC logging.
    #[default]
    None,
    /// One line per collection.
    Brief,
    /// Per-handle detail.
    All,
}

/// Documentation emitter gate. The emitter itself lives outside the
/// core; the option is parsed and stored for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentMode {
    /// Document user code only.
    #[default]
    User,
    /// Document built-in types only.
    Builtin,
    /// Document everything.
    All,
}

/// Runtime-only options the compiler forwards to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOption {
    /// `call-stack-size`
    CallStackSize(usize),
    /// `data-stack-size`
    DataStackSize(usize),
    /// `stack-size` (sets both)
    StackSize(usize),
}

/// What a single `name=value` pair turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionOutcome {
    /// A compile option; already applied to the option set.
    Applied,
    /// A runtime option the VM must apply while uninitialized.
    Runtime(RuntimeOption),
}

/// The full compiler option set with the release defaults.
#[derive(Debug, Clone)]
pub struct Options {
    /// Emit progress, link stats and allocation counters.
    pub verbose: bool,
    /// Warning gate 0-4; diagnostics above the level are dropped.
    pub warning_level: u32,
    /// Local variable placement.
    pub locals_mode: LocalsMode,
    /// Optimization level 0-3. Level 3 forces stack locals.
    pub optimize: u32,
    /// Emit runtime type checks before dynamic operations.
    pub use_rtchk: bool,
    /// Extension used to resolve `import` names to files.
    pub file_ext: String,
    /// Allow resolving imports from the file system.
    pub file_import: bool,
    /// Diagnostic rendering style.
    pub error_format: ErrorFormat,
    /// Treat bare numeric literals as float.
    pub default_float: bool,
    /// GC logging detail.
    pub log_garbage: GcLog,
    /// Documentation emitter gate.
    pub document: DocumentMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verbose: false,
            warning_level: 3,
            locals_mode: LocalsMode::Stack,
            optimize: 3,
            use_rtchk: true,
            file_ext: "bc".into(),
            file_import: false,
            error_format: ErrorFormat::Default,
            default_float: false,
            log_garbage: GcLog::None,
            document: DocumentMode::User,
        }
    }
}

impl Options {
    /// Effective locals mode: optimization level 3 forces stack locals.
    pub fn effective_locals_mode(&self) -> LocalsMode {
        if self.optimize >= 3 {
            LocalsMode::Stack
        } else {
            self.locals_mode
        }
    }

    /// Parse one option string, applying compile options in place and
    /// returning any runtime options for the embedder to apply.
    pub fn parse(&mut self, input: &str) -> Result<Vec<RuntimeOption>, CompileErrorKind> {
        let mut runtime = Vec::new();
        for pair in input
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            match self.parse_pair(pair)? {
                OptionOutcome::Applied => {}
                OptionOutcome::Runtime(opt) => runtime.push(opt),
            }
        }
        Ok(runtime)
    }

    fn parse_pair(&mut self, pair: &str) -> Result<OptionOutcome, CompileErrorKind> {
        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            // A bare flag name means "enable".
            None => (pair, "1"),
        };

        let bad = || CompileErrorKind::BadOptionValue(pair.to_string());

        match name {
            "verbose" => self.verbose = parse_bool(value).ok_or_else(bad)?,
            "warning-level" => {
                let level = value.parse::<u32>().ok().filter(|&l| l <= 4).ok_or_else(bad)?;
                self.warning_level = level;
            }
            "stack-locals" => {
                self.locals_mode = match value {
                    "0" => LocalsMode::Auto,
                    "1" => LocalsMode::Stack,
                    _ => return Err(bad()),
                };
            }
            "optimize" => {
                let level = value.parse::<u32>().ok().filter(|&l| l <= 3).ok_or_else(bad)?;
                self.optimize = level;
            }
            "use-rtchk" => self.use_rtchk = parse_bool(value).ok_or_else(bad)?,
            "file-ext" => {
                if value.is_empty()
                    || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(bad());
                }
                self.file_ext = value.to_string();
            }
            "file-import" => self.file_import = parse_bool(value).ok_or_else(bad)?,
            "error-format" => {
                self.error_format = match value {
                    "default" => ErrorFormat::Default,
                    "ms" => ErrorFormat::Ms,
                    _ => return Err(bad()),
                };
            }
            "default-float" => self.default_float = parse_bool(value).ok_or_else(bad)?,
            "log-garbage" => {
                self.log_garbage = match value {
                    "none" => GcLog::None,
                    "brief" => GcLog::Brief,
                    "all" => GcLog::All,
                    _ => return Err(bad()),
                };
            }
            "document" => {
                self.document = match value {
                    "user" => DocumentMode::User,
                    "builtin" => DocumentMode::Builtin,
                    "all" => DocumentMode::All,
                    _ => return Err(bad()),
                };
            }
            "call-stack-size" => {
                return Ok(OptionOutcome::Runtime(RuntimeOption::CallStackSize(
                    value.parse().map_err(|_| bad())?,
                )))
            }
            "data-stack-size" => {
                return Ok(OptionOutcome::Runtime(RuntimeOption::DataStackSize(
                    value.parse().map_err(|_| bad())?,
                )))
            }
            "stack-size" => {
                return Ok(OptionOutcome::Runtime(RuntimeOption::StackSize(
                    value.parse().map_err(|_| bad())?,
                )))
            }
            _ => return Err(bad()),
        }
        Ok(OptionOutcome::Applied)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "yes" | "true" => Some(true),
        "0" | "no" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.warning_level, 3);
        assert_eq!(opts.optimize, 3);
        assert!(opts.use_rtchk);
        assert_eq!(opts.file_ext, "bc");
        assert_eq!(opts.effective_locals_mode(), LocalsMode::Stack);
    }

    #[test]
    fn test_parse_mixed_separators() {
        let mut opts = Options::default();
        let runtime = opts
            .parse("verbose=1, optimize=0; warning-level=4,stack-locals=0")
            .unwrap();
        assert!(runtime.is_empty());
        assert!(opts.verbose);
        assert_eq!(opts.optimize, 0);
        assert_eq!(opts.warning_level, 4);
        assert_eq!(opts.effective_locals_mode(), LocalsMode::Auto);
    }

    #[test]
    fn test_optimize_three_forces_stack_locals() {
        let mut opts = Options::default();
        opts.parse("stack-locals=0, optimize=3").unwrap();
        assert_eq!(opts.locals_mode, LocalsMode::Auto);
        assert_eq!(opts.effective_locals_mode(), LocalsMode::Stack);
    }

    #[test]
    fn test_runtime_options_are_forwarded() {
        let mut opts = Options::default();
        let runtime = opts.parse("data-stack-size=4096;verbose").unwrap();
        assert_eq!(runtime, vec![RuntimeOption::DataStackSize(4096)]);
        assert!(opts.verbose);
    }

    #[test]
    fn test_bad_values() {
        let mut opts = Options::default();
        assert!(opts.parse("optimize=9").is_err());
        assert!(opts.parse("file-ext=a.b").is_err());
        assert!(opts.parse("no-such-option=1").is_err());
        assert!(opts.parse("error-format=gcc").is_err());
    }

    #[test]
    fn test_file_ext() {
        let mut opts = Options::default();
        opts.parse("file-ext=script").unwrap();
        assert_eq!(opts.file_ext, "script");
    }
}
