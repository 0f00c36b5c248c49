const MAX_FLAGS: usize = 32;
const MAX_FLAG_LEN: usize = 128;

/// Flags that redirect compiler output, load code, or read arbitrary files.
const DENIED_PREFIXES: &[&str] = &[
    "-o",
    "-B",
    "-I",
    "-L",
    "-isystem",
    "-iquote",
    "-include",
    "-imacros",
    "-specs",
    "-wrapper",
    "-fplugin",
    "-Wl,",
    "-Wa,",
    "-Wp,",
    "-Xlinker",
    "-Xassembler",
    "-save-temps",
    "--sysroot",
    "--out-dir",
    "--extern",
    "-d",
    "-cp",
    "-classpath",
    "--class-path",
    "-processorpath",
    "-J",
    "-C",
    "-Z",
];

/// Accepts only plain option tokens: a leading dash, then a conservative
/// character set, and nothing from [`DENIED_PREFIXES`].
pub fn validate_flags(flags: &[String]) -> Result<(), String> {
    if flags.len() > MAX_FLAGS {
        return Err(format!("at most {MAX_FLAGS} compiler flags are allowed"));
    }
    for flag in flags {
        if flag.is_empty() || flag.len() > MAX_FLAG_LEN {
            return Err(format!("invalid compiler flag length: {:?}", flag));
        }
        if !flag.starts_with('-') {
            return Err(format!("compiler flag must start with '-': {flag}"));
        }
        if !flag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '+' | '.' | ':' | ','))
        {
            return Err(format!("compiler flag contains forbidden characters: {flag}"));
        }
        if flag.contains("..") {
            return Err(format!("compiler flag may not reference paths: {flag}"));
        }
        if let Some(prefix) = DENIED_PREFIXES.iter().find(|p| flag.starts_with(**p)) {
            return Err(format!("compiler flag {prefix} is not permitted"));
        }
    }
    Ok(())
}

/// Program arguments are passed verbatim but must be plain text.
pub fn validate_args(args: &[String]) -> Result<(), String> {
    if args.len() > MAX_FLAGS {
        return Err(format!("at most {MAX_FLAGS} program arguments are allowed"));
    }
    match args.iter().find(|a| a.len() > MAX_FLAG_LEN || a.contains('\0')) {
        Some(arg) => Err(format!("invalid program argument: {:?}", arg)),
        None => Ok(()),
    }
}
