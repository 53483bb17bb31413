use std::{fs, path::PathBuf};

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use codesnake::{Block, CodeWidth, Label, LineIndex};
use lamc::{
    runtime::{machine, Value},
    Assembly, CompileError, Compiler, CompilerOptions,
};
use rustyline::{error::ReadlineError, DefaultEditor};
use tracing_subscriber::EnvFilter;
use yansi::Paint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Print the NASM source
    Asm,
    /// Execute on the reference machine and print the result
    Run,
}

#[derive(Parser)]
#[command(name = "lamc", about = "Compile a small Lisp to x86-64 assembly")]
struct Cli {
    /// Source file to compile. Starts a REPL when omitted
    file: Option<PathBuf>,

    /// Name of the exported entry function
    #[arg(long, default_value = "main")]
    entry: String,

    /// Leave comments out of the generated assembly
    #[arg(long)]
    no_comments: bool,

    #[arg(long, value_enum, default_value_t = Emit::Asm)]
    emit: Emit,

    /// Write the assembly here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn report(name: &str, source: &str, error: &CompileError) {
    eprintln!("{} {error}", "error:".red().bold());
    let Some(span) = error.span().filter(|span| !span.is_empty()) else {
        return;
    };

    let idx = LineIndex::new(source);
    let label = Label::new(span)
        .with_text(error.to_string().red().to_string())
        .with_style(|s: String| s.red().to_string());
    if let Some(block) = Block::new(&idx, [label]) {
        let block = block.map_code(|c| CodeWidth::new(c, c.len()));
        eprintln!("{}[{name}]", block.prologue());
        eprint!("{block}");
        eprintln!("{}", block.epilogue());
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Data(word) => word.to_string(),
        Value::Closure(closure) => format!(
            "#<closure: {} bound, {} captured>",
            closure.n_bound,
            closure.n_free()
        ),
    }
}

fn run(assembly: &Assembly) -> anyhow::Result<String> {
    let finished = machine::run(assembly)?;
    tracing::debug!(steps = finished.steps, "program finished");
    Ok(render(&finished.value))
}

fn repl(mut compiler: Compiler) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new()?;
    let mut show_asm = false;
    println!(
        "lamc {}: ,asm toggles assembly output, ,quit exits",
        env!("CARGO_PKG_VERSION")
    );

    loop {
        let line = match editor.readline(">> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(error) => return Err(error.into()),
        };

        let input = line.trim();
        match input {
            "" => continue,
            ",quit" | ",q" => break,
            ",asm" => {
                show_asm = !show_asm;
                println!("assembly output {}", if show_asm { "on" } else { "off" });
                continue;
            }
            _ => {}
        }
        let _ = editor.add_history_entry(input);

        match compiler.compile(input) {
            Ok(assembly) => {
                if show_asm {
                    print!("{assembly}");
                }
                match run(&assembly) {
                    Ok(value) => println!("{}", value.green()),
                    Err(error) => eprintln!("{} {error}", "runtime error:".red().bold()),
                }
            }
            Err(error) => report("repl", input, &error),
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut compiler = Compiler::new(CompilerOptions {
        entry: cli.entry.into(),
        comments: !cli.no_comments,
    });

    let Some(path) = &cli.file else {
        return repl(compiler);
    };

    let source =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let assembly = match compiler.compile(&source) {
        Ok(assembly) => assembly,
        Err(error) => {
            report(&path.display().to_string(), &source, &error);
            std::process::exit(1);
        }
    };

    match (cli.emit, &cli.output) {
        (Emit::Asm, Some(output)) => fs::write(output, assembly.to_string())
            .with_context(|| format!("writing {}", output.display()))?,
        (Emit::Asm, None) => print!("{assembly}"),
        (Emit::Run, _) => println!("{}", run(&assembly)?),
    }
    Ok(())
}
