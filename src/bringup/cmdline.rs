//! The boot command-line grammar.
//!
//! The command line is a whitespace-separated token stream, split into
//! program groups at each occurrence of the level separator (`--` at the
//! top, `++` one level down, and so on). The first token of the whole line
//! names the kernel binary; its directory is where boot modules are loaded
//! from. A group whose program name starts with `kernel` describes a
//! nested kernel and is recursively split with the next separator.
//!
//! ```text
//! build/kernel -- hello daemon -- kernel2 pes=2 ++ child a1 -- world
//! └────┬─────┘    └────┬─────┘    └──────────────┬───────┘
//!  kernel path     module hello       module kernel2 (recursed: child)
//! ```
//!
//! Kernel arguments (`daemon`, `requires=`, `core=`, `pes=`, `repeat=`)
//! bind to the enclosing kernel rather than the program; `pes=` and
//! `repeat=` (the latter only for kernels) are retained in the group's
//! argument string. Module names are deduplicated across all levels.

use std::path::Path;

/// Level separators, outermost first.
pub const DEFAULT_SEPARATORS: &[&str] = &["--", "++"];

/// Arguments that belong to the enclosing kernel, not the program.
pub fn is_kernel_arg(arg: &str) -> bool {
    arg == "daemon"
        || arg.starts_with("requires=")
        || arg.starts_with("core=")
        || arg.starts_with("pes=")
        || arg.starts_with("repeat=")
}

/// All whitespace-separated tokens, separators included. This is exactly
/// what lands in the kernel's argv.
pub fn split_args(cmdline: &str) -> Vec<&str> {
    cmdline.split_whitespace().collect()
}

/// Extract the kernel's directory and the deduplicated list of boot
/// modules (name, bound argument string) from the command line.
pub fn extract_modules(cmdline: &str, separators: &[&str]) -> (String, Vec<(String, String)>) {
    let mut mods = Vec::new();
    let mut kernel_path = String::new();
    extract_level(cmdline, separators, 0, true, &mut kernel_path, &mut mods);
    (kernel_path, mods)
}

fn extract_level(
    args: &str,
    separators: &[&str],
    lvl: usize,
    top: bool,
    kernel_path: &mut String,
    mods: &mut Vec<(String, String)>,
) {
    let sep = separators.get(lvl).copied();
    let mut prog = String::new();
    let mut argstr = String::new();
    let mut first = top;

    for tok in args.split_whitespace() {
        if first {
            // the first token names the kernel; remember its directory
            *kernel_path = Path::new(tok)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            first = false;
        } else if Some(tok) == sep {
            flush_group(&mut prog, &mut argstr, separators, lvl, kernel_path, mods);
        } else if tok.starts_with("pes=") {
            // PE assignment is not allowed for the initial kernel
            assert!(!(prog.is_empty() && lvl == 0), "pes= before any program");
            push_arg(&mut argstr, tok);
        } else if tok.starts_with("repeat=") && prog.starts_with("kernel") {
            push_arg(&mut argstr, tok);
        } else if prog.is_empty() {
            // leading kernel args of a recursed group do not name a program
            if !is_kernel_arg(tok) {
                prog = tok.to_string();
            }
        } else if !is_kernel_arg(tok) {
            push_arg(&mut argstr, tok);
        }
    }

    flush_group(&mut prog, &mut argstr, separators, lvl, kernel_path, mods);
}

fn flush_group(
    prog: &mut String,
    argstr: &mut String,
    separators: &[&str],
    lvl: usize,
    kernel_path: &mut String,
    mods: &mut Vec<(String, String)>,
) {
    // nested kernels bring their own modules
    if prog.starts_with("kernel") {
        extract_level(argstr, separators, lvl + 1, false, kernel_path, mods);
    }

    if !prog.is_empty() && !mods.iter().any(|(name, _)| name.as_str() == prog.as_str()) {
        mods.push((std::mem::take(prog), std::mem::take(argstr)));
    } else {
        prog.clear();
        argstr.clear();
    }
}

fn push_arg(argstr: &mut String, arg: &str) {
    if !argstr.is_empty() {
        argstr.push(' ');
    }
    argstr.push_str(arg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(cmdline: &str) -> (String, Vec<(String, String)>) {
        extract_modules(cmdline, DEFAULT_SEPARATORS)
    }

    #[test]
    fn test_kernel_only() {
        let (path, mods) = extract("build/bin/kernel");
        assert_eq!(path, "build/bin");
        assert!(mods.is_empty());
    }

    #[test]
    fn test_simple_modules() {
        let (path, mods) = extract("build/kernel -- hello -- world a b");
        assert_eq!(path, "build");
        assert_eq!(
            mods,
            vec![
                ("hello".to_string(), String::new()),
                ("world".to_string(), "a b".to_string()),
            ]
        );
    }

    #[test]
    fn test_kernel_args_are_dropped() {
        let (_, mods) = extract("kernel -- srv daemon requires=net core=2 -- cli");
        assert_eq!(
            mods,
            vec![
                ("srv".to_string(), String::new()),
                ("cli".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_pes_is_retained() {
        let (_, mods) = extract("kernel -- srv pes=4 x");
        assert_eq!(mods, vec![("srv".to_string(), "pes=4 x".to_string())]);
    }

    #[test]
    #[should_panic]
    fn test_pes_before_program_is_rejected() {
        extract("kernel -- pes=4 srv");
    }

    #[test]
    fn test_repeat_only_for_kernels() {
        let (_, mods) = extract("kernel -- kernel2 repeat=2 -- srv repeat=2");
        assert_eq!(
            mods,
            vec![
                ("kernel2".to_string(), "repeat=2".to_string()),
                ("srv".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_nested_kernel_modules() {
        let (_, mods) = extract("boot/kernel -- kernel2 sub1 ++ sub2 -- hello");
        let names: Vec<&str> = mods.iter().map(|(n, _)| n.as_str()).collect();
        // the nested kernel's modules come first, then the kernel itself
        assert_eq!(names, vec!["sub1", "sub2", "kernel2", "hello"]);
    }

    #[test]
    fn test_modules_are_deduplicated() {
        let (_, mods) = extract("kernel -- hello -- kernel2 hello ++ world -- world");
        let names: Vec<&str> = mods.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["hello", "world", "kernel2"]);
    }

    #[test]
    fn test_split_args_keeps_separators() {
        let args = split_args("kernel -- hello  world");
        assert_eq!(args, vec!["kernel", "--", "hello", "world"]);
    }
}
