//! Turns a raw session command into program arguments.
//!
//! The configured shell decides how the raw string is wrapped. The raw
//! string itself is always passed on as a single argument and never split.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ComposeError;

const POSIX_SHELLS: &[&str] = &["sh", "bash", "zsh", "ash", "dash", "fish"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `shell -c raw`
    Posix,
    /// `cmd /c raw`
    Cmd,
    /// `powershell -EncodedCommand base64(utf16le(raw))`
    PowerShell,
    /// Shell string split into words, raw appended.
    Generic,
}

impl Dialect {
    pub fn detect(shell: &str) -> Self {
        let shell = shell.trim();
        if shell.is_empty() || shell.split_whitespace().nth(1).is_some() {
            return Dialect::Generic;
        }

        let name = Path::new(shell)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(shell)
            .to_ascii_lowercase();
        // Windows paths keep their backslashes on unix hosts.
        let name = name.rsplit('\\').next().unwrap_or(&name);
        let name = name.strip_suffix(".exe").unwrap_or(name);

        match name {
            "cmd" => Dialect::Cmd,
            "powershell" | "pwsh" => Dialect::PowerShell,
            name if POSIX_SHELLS.contains(&name) => Dialect::Posix,
            _ => Dialect::Generic,
        }
    }
}

/// Builds argv for `raw` under the configured `shell`. `argv[0]` is the
/// program to run.
pub fn compose(raw: &str, shell: &str) -> Result<Vec<String>, ComposeError> {
    if raw.contains('\0') {
        return Err(ComposeError::Encoding(raw.to_string()));
    }

    if raw.is_empty() {
        return split_shell(shell);
    }

    let shell = shell.trim();
    let argv = match Dialect::detect(shell) {
        Dialect::Posix => vec![shell.to_string(), "-c".to_string(), raw.to_string()],
        Dialect::Cmd => vec![shell.to_string(), "/c".to_string(), raw.to_string()],
        Dialect::PowerShell => vec![
            shell.to_string(),
            "-EncodedCommand".to_string(),
            encode_powershell(raw),
        ],
        Dialect::Generic => {
            let mut words = split_shell(shell)?;
            words.push(raw.to_string());
            words
        }
    };
    Ok(argv)
}

/// Base64 of the UTF-16LE bytes of `raw`, as `-EncodedCommand` expects.
pub fn encode_powershell(raw: &str) -> String {
    let bytes: Vec<u8> = raw.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

fn split_shell(shell: &str) -> Result<Vec<String>, ComposeError> {
    let words = shell_words::split(shell).map_err(|e| ComposeError::Lex {
        shell: shell.to_string(),
        reason: e.to_string(),
    })?;
    if words.first().map_or(true, |program| program.is_empty()) {
        return Err(ComposeError::EmptyShell(shell.to_string()));
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_powershell(encoded: &str) -> String {
        let bytes = STANDARD.decode(encoded).unwrap();
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).unwrap()
    }

    #[test]
    fn test_posix_shells_take_raw_as_one_argument() {
        for shell in POSIX_SHELLS {
            let argv = compose("echo 'a  b' | wc -c; exit 3", shell).unwrap();
            assert_eq!(argv, vec![*shell, "-c", "echo 'a  b' | wc -c; exit 3"]);
        }
    }

    #[test]
    fn test_sh_echo() {
        assert_eq!(compose("echo hi", "sh").unwrap(), vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_dialect_from_full_path() {
        assert_eq!(Dialect::detect("/usr/bin/bash"), Dialect::Posix);
        assert_eq!(Dialect::detect(r"C:\Windows\System32\cmd.exe"), Dialect::Cmd);
        assert_eq!(Dialect::detect("PWSH.EXE"), Dialect::PowerShell);
        assert_eq!(Dialect::detect("bash --login"), Dialect::Generic);
        assert_eq!(Dialect::detect("python3"), Dialect::Generic);
    }

    #[test]
    fn test_cmd() {
        assert_eq!(
            compose("dir /b", "cmd").unwrap(),
            vec!["cmd", "/c", "dir /b"]
        );
    }

    #[test]
    fn test_powershell_get_date() {
        let argv = compose("Get-Date", "powershell").unwrap();
        assert_eq!(argv[..2], ["powershell", "-EncodedCommand"]);
        assert_eq!(argv[2], "RwBlAHQALQBEAGEAdABlAA==");
    }

    #[test]
    fn test_powershell_encoding_round_trips() {
        for raw in [
            "Get-Date",
            "Write-Host \"héllo wörld\"; exit 2",
            "echo 日本語 🚀",
            "$x = 'a'`n$x",
        ] {
            let argv = compose(raw, "pwsh").unwrap();
            assert_eq!(decode_powershell(&argv[2]), raw);
        }
    }

    #[test]
    fn test_generic_shell_is_lexed() {
        let argv = compose("print(1)", "python3 -u -c").unwrap();
        assert_eq!(argv, vec!["python3", "-u", "-c", "print(1)"]);

        let argv = compose("x", "'/opt/my shell' --flag=\"a b\"").unwrap();
        assert_eq!(argv, vec!["/opt/my shell", "--flag=a b", "x"]);
    }

    #[test]
    fn test_unknown_single_word_shell_falls_back() {
        assert_eq!(compose("ls", "nu").unwrap(), vec!["nu", "ls"]);
    }

    #[test]
    fn test_empty_command_runs_shell_alone() {
        assert_eq!(compose("", "bash").unwrap(), vec!["bash"]);
        assert_eq!(compose("", "powershell").unwrap(), vec!["powershell"]);
        assert_eq!(compose("", "bash -l").unwrap(), vec!["bash", "-l"]);
    }

    #[test]
    fn test_unlexable_shell_is_an_error() {
        let err = compose("ls", "bash -c 'oops").unwrap_err();
        assert!(matches!(err, ComposeError::Lex { ref shell, .. } if shell == "bash -c 'oops"));
    }

    #[test]
    fn test_empty_shell_is_an_error() {
        assert!(matches!(compose("", ""), Err(ComposeError::EmptyShell(_))));
        assert!(matches!(compose("ls", "''"), Err(ComposeError::EmptyShell(_))));
    }

    #[test]
    fn test_nul_in_command_is_rejected() {
        assert!(matches!(
            compose("echo \0", "sh"),
            Err(ComposeError::Encoding(_))
        ));
    }
}
