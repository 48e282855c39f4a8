use std::io::Read;

use loaf_apply_patch::apply_patch;

/// Reads a patch from the first argument (or stdin when absent/`-`) and
/// applies it to the current working directory.
fn main() -> std::process::ExitCode {
    let mut args = std::env::args();
    let _argv0 = args.next();
    let patch = match args.next() {
        Some(arg) if arg != "-" => arg,
        _ => {
            let mut buffer = String::new();
            if let Err(e) = std::io::stdin().read_to_string(&mut buffer) {
                eprintln!("Failed to read patch from stdin: {e}");
                return std::process::ExitCode::FAILURE;
            }
            buffer
        }
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    match apply_patch(&patch, &mut stdout, &mut stderr) {
        Ok(_) => std::process::ExitCode::SUCCESS,
        Err(_) => std::process::ExitCode::FAILURE,
    }
}
