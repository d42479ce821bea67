//! # SSI
//!
//! The interactive front end of the symbolic source interpreter. It loads a
//! C file, binds the usual driver-module helpers, runs the globals pass, and
//! drops into a prompt for poking at the simulated machine.

mod cli;
mod repl;

use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;

use log::{error, info};
use serde::Serialize;

use ssi::interpreter::{EmitArg, InterpError, Interpreter, Step};

use cli::Cli;

/// Metadata collected from `MODULE_*` lines during the globals pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ModuleInfo {
    pub authors: Vec<String>,
    pub description: Option<String>,
    pub license: Option<String>,
}

fn deref_string(interp: &mut Interpreter, value: ssi::trace::ValueId) -> Option<String> {
    let inner = interp.emit("(* {0})", &[EmitArg::Val(value)]).ok()??;
    match interp.trace.cval(inner) {
        ssi::trace::Payload::Str(s) => Some(s.clone()),
        _ => None,
    }
}

fn register_module_handlers(interp: &mut Interpreter, info: Rc<RefCell<ModuleInfo>>) {
    let authors = info.clone();
    interp.register_fn(
        "MODULE_AUTHOR",
        Rc::new(move |interp, args| {
            if let Some(&arg) = args.first() {
                if let Some(name) = deref_string(interp, arg) {
                    authors.borrow_mut().authors.push(name);
                }
            }
            Ok(None)
        }),
    );

    let description = info.clone();
    interp.register_fn(
        "MODULE_DESCRIPTION",
        Rc::new(move |interp, args| {
            if let Some(&arg) = args.first() {
                description.borrow_mut().description = deref_string(interp, arg);
            }
            Ok(None)
        }),
    );

    let license = info;
    interp.register_fn(
        "MODULE_LICENSE",
        Rc::new(move |interp, args| {
            if let Some(&arg) = args.first() {
                license.borrow_mut().license = deref_string(interp, arg);
            }
            Ok(None)
        }),
    );
}

/// Step until the end of the stream, a top-level return, or the step cap.
pub fn run_bounded(interp: &mut Interpreter, limit: usize) -> Result<(), InterpError> {
    for _ in 0..limit {
        match interp.step() {
            Ok(Step::Eof) => break,
            Ok(Step::Return(_)) => break,
            Ok(Step::Ran) => {}
            Err(InterpError::EndOfStream) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::init();

    simple_logger::init_with_level((&args.verbosity).into()).unwrap();

    let mut interp = Interpreter::new(&args.file)?;

    // The kernel sources assume a `true` binding.
    let truth = interp.trace.local("true");
    let one = interp.trace.imm_int(1);
    let cell = interp.trace.as_memref(truth)?;
    interp.trace.set_value(cell, one)?;

    let module_info = Rc::new(RefCell::new(ModuleInfo::default()));
    register_module_handlers(&mut interp, module_info.clone());

    // ssi_explain(x) prints how *x came to be.
    interp.register_fn(
        "ssi_explain",
        Rc::new(|interp: &mut Interpreter, args| {
            if let Some(&arg) = args.first() {
                if let Some(value) = interp.emit("(* {0})", &[EmitArg::Val(arg)])? {
                    print!("{}", interp.explain_value(value));
                }
            }
            Ok(None)
        }),
    );

    info!("running globals pass over {}", args.file.display());
    if let Err(e) = interp.globals_pass() {
        error!("globals pass failed: {e}");
        std::process::exit(-1);
    }

    let collected = module_info.borrow().clone();
    if let Some(description) = &collected.description {
        println!("Loaded driver: {description}");
    }
    if !collected.authors.is_empty() {
        println!("\tAuthor(s): {}", collected.authors.join(", "));
    }
    if let Some(license) = &collected.license {
        println!("\tLicense: {license}");
    }
    if args.module_info {
        println!("{}", serde_json::to_string_pretty(&collected)?);
    }

    if !args.no_prompt {
        repl::run(&mut interp, args.step_limit)?;
    }

    Ok(())
}
