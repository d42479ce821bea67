//! The interactive prompt: a thin layer over the interpreter API for
//! exploring the simulated memory, setting breakpoints and running C
//! snippets against the current state.

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use colored::Colorize;
use log::warn;

use ssi::interpreter::Interpreter;

use crate::run_bounded;

const HELP: &str = "\
  pm              print the memory tree
  b <line>        break before executing <line>
  xc <code>       execute a C expression and print the result cell
  xf <name> <code>   print the <name> field of the expression's cell
  xl <line>       jump to <line> and run
  verbose <fn> [fmt ...]   print arguments at each call of <fn>
  c               continue execution
  q               quit";

pub fn run(interp: &mut Interpreter, step_limit: usize) -> Result<(), Box<dyn Error>> {
    if let Some(line) = interp.current_line() {
        println!("{} on line {line}", "ssi ::".bold());
    }

    let stdin = io::stdin();
    loop {
        print!("{} ", "ssi >".bold());
        io::stdout().flush()?;

        let mut command = String::new();
        if stdin.lock().read_line(&mut command)? == 0 {
            return Ok(());
        }
        let command = command.trim();

        if command == "q" {
            return Ok(());
        } else if command == "c" {
            run_bounded(interp, step_limit)?;
            if let Some(line) = interp.current_line() {
                println!("{} on line {line}", "ssi ::".bold());
            }
        } else if command == "pm" {
            print!("{}", interp.trace.print_pyify(interp.trace.root()));
        } else if let Some(rest) = command.strip_prefix("b ") {
            match rest.trim().parse::<usize>() {
                Ok(line) => {
                    interp.break_lines.insert(
                        line,
                        Rc::new(move |interp: &mut Interpreter| {
                            println!("breakpoint hit on line {line}");
                            if let Some(current) = interp.current_line() {
                                println!("ssi :: On line {current}");
                            }
                            Ok(())
                        }),
                    );
                }
                Err(_) => warn!("not a line number: {rest}"),
            }
        } else if let Some(code) = command.strip_prefix("xc ") {
            match interp.exec_c(code, &[]) {
                Ok(Some(value)) => match interp.trace.as_memref(value) {
                    Ok(cell) => print!("{}", interp.trace.print_pyify(cell)),
                    Err(e) => println!("error: {e}"),
                },
                Ok(None) => println!("(no value)"),
                Err(e) => println!("error: {e}"),
            }
        } else if let Some(rest) = command.strip_prefix("xf ") {
            let (name, code) = match rest.trim().split_once(' ') {
                Some(split) => split,
                None => {
                    println!("usage: xf <field> <code>");
                    continue;
                }
            };
            match interp.exec_c(code, &[]) {
                Ok(Some(value)) => {
                    let field = interp
                        .trace
                        .as_memref(value)
                        .and_then(|cell| interp.trace.field(cell, name));
                    match field {
                        Ok(cell) => print!("{}", interp.trace.print_pyify(cell)),
                        Err(e) => println!("error: {e}"),
                    }
                }
                Ok(None) => println!("(no value)"),
                Err(e) => println!("error: {e}"),
            }
        } else if let Some(rest) = command.strip_prefix("xl ") {
            match rest.trim().parse::<usize>() {
                Ok(line) => {
                    interp.set_to_line(line);
                    run_bounded(interp, step_limit)?;
                }
                Err(_) => warn!("not a line number: {rest}"),
            }
        } else if let Some(rest) = command.strip_prefix("verbose ") {
            let mut parts = rest.split_whitespace();
            if let Some(name) = parts.next() {
                let formats: Vec<String> = parts.map(str::to_string).collect();
                interp.verbose_fns.insert(name.to_string(), formats);
            }
        } else if command == "help" || command == "?" {
            println!("{HELP}");
        } else if !command.is_empty() {
            println!("ssi > Unknown command {command:?}");
        }
    }
}
