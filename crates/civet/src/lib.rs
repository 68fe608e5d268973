//! civet: a small embeddable scripting language.
//!
//! Scripts are parsed into an AST, compiled to a compact 32-bit-instruction
//! register bytecode and executed by a stack-based VM with a tracing
//! mark-and-sweep garbage collector. The language is dynamically typed:
//! null, booleans, IEEE-754 numbers, immutable strings, arrays, maps and
//! first-class functions with closures.
//!
//! # Example
//!
//! ```
//! use civet::{Program, Value};
//!
//! let mut prog = Program::new();
//! prog.compile_str(
//!     "add.cv",
//!     "function add(a, b) { return a + b; }",
//! )
//! .unwrap();
//! let ret = prog.call("add", &[Value::Number(2.0), Value::Number(3.0)]).unwrap();
//! assert_eq!(ret.as_number(), Some(5.0));
//! ```

mod ast;
mod bytecode;
mod error;
mod heap;
mod intern;
mod io;
mod lexer;
mod operator;
mod parser;
mod program;
mod srcloc;
mod value;
mod vm;

pub use error::{Error, ErrorKind, SrcLoc};
pub use heap::HeapId;
pub use io::{CollectStringPrint, PrintWriter, StdPrint};
pub use program::{NativeFn, Program};
pub use value::{NativeId, Value};
