//! Teng — a general purpose text templating engine.
//!
//! Templates interleave literal text with directives (`<?teng …?>`) and
//! expressions (`${…}`); the engine compiles them through a two-stage
//! lexer and a grammar-driven compiler into a flat instruction program,
//! folds constants during compilation, and executes the program with a
//! stack-based interpreter against a caller-supplied fragment tree.
//! Compiled programs, dictionaries and configurations live in LRU caches
//! with dependency-aware invalidation; printed values escape per the
//! active content type.
//!
//! ```
//! use teng::{ErrorLog, Fragment, StringWriter, generate_string};
//!
//! let mut data = Fragment::new();
//! data.add_string("name", "World");
//! let mut writer = StringWriter::new();
//! let mut err = ErrorLog::new();
//! generate_string("Hello, ${name}!", &data, &mut writer, &mut err);
//! assert_eq!(writer.output(), "Hello, World!");
//! ```

mod cache;
mod compiler;
mod configuration;
mod contenttype;
mod dictionary;
mod engine;
mod error;
mod formatter;
mod fragment;
mod fs;
mod functions;
mod instruction;
mod lex1;
mod lex2;
mod position;
mod program;
mod sourcelist;
mod udf;
mod value;
mod vm;
mod writer;

pub use crate::{
    configuration::Configuration,
    contenttype::{ContentType, Descriptor},
    dictionary::Dictionary,
    engine::{GenPageArgs, Settings, Teng, generate_string},
    error::{Entry, ErrorLog, Level},
    formatter::Mode as FormatMode,
    fragment::{Fragment, FragmentJsonError, FragmentList, FragmentValue},
    fs::{Filesystem, InMemoryFilesystem, NativeFilesystem},
    position::Pos,
    udf::{UdfCallable, UdfRegistry},
    value::{ListRef, RegexVal, Value},
    writer::{StreamWriter, StringWriter, Writer},
};
