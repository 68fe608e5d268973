//! Output abstraction for the `print` family of native functions.

use std::io::{self, Write as _};

/// Trait for handling output from the `print` and `printf` natives.
///
/// Implement this to capture or redirect script output. The default
/// implementation [`StdPrint`] writes to stdout.
pub trait PrintWriter {
    /// Writes one chunk of already-formatted output.
    ///
    /// Implementations must not add separators or newlines; the natives emit
    /// exactly what the script asked for.
    fn write_str(&mut self, output: &str);
}

/// Default `PrintWriter` that writes to stdout.
#[derive(Debug)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_str(&mut self, output: &str) {
        // A broken stdout pipe is not a script error; ignore it.
        let _ = io::stdout().write_all(output.as_bytes());
    }
}

/// `PrintWriter` that collects all output into a shared string buffer,
/// for tests and embedders that want to capture script output.
///
/// Clones share the buffer, so a clone handed to the program can be
/// observed through the original:
///
/// ```
/// use civet::{CollectStringPrint, Program};
///
/// let collector = CollectStringPrint::new();
/// let mut prog = Program::with_print(Box::new(collector.clone()));
/// prog.compile_str("t.cv", "function main() { print(\"hi\"); }").unwrap();
/// prog.call("main", &[]).unwrap();
/// assert_eq!(collector.output(), "hi");
/// ```
#[derive(Debug, Clone, Default)]
pub struct CollectStringPrint {
    output: std::rc::Rc<std::cell::RefCell<String>>,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn output(&self) -> String {
        self.output.borrow().clone()
    }

    /// Clears the buffer.
    pub fn reset(&self) {
        self.output.borrow_mut().clear();
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_str(&mut self, output: &str) {
        self.output.borrow_mut().push_str(output);
    }
}
