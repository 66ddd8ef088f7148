use crate::config::UtilityConfig;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

/// Captured result of one external process run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Seam between the clients and the operating system. Runs synchronously;
/// async callers wrap it in `spawn_blocking`.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        debug!(program, ?args, "запуск внешней утилиты");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: decode_cmd_stdout(&output.stdout),
            stderr: decode_cmd_stdout(&output.stderr),
        })
    }
}

/// Builds `<args...> -Action <action> [<flag> <value>...]`.
pub fn action_args(utility: &UtilityConfig, action: &str, extra: &[(&str, &str)]) -> Vec<String> {
    let mut args = Vec::with_capacity(utility.args.len() + 2 + extra.len() * 2);
    args.extend(utility.args.iter().cloned());
    args.push("-Action".to_string());
    args.push(action.to_string());
    for (flag, value) in extra {
        args.push((*flag).to_string());
        args.push((*value).to_string());
    }
    args
}

/// PowerShell redirected to a pipe may emit UTF-16LE; fall back to it before
/// giving up and decoding lossily.
pub fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.trim_start_matches('\u{feff}').to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s.trim_start_matches('\u{feff}').to_string();
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    fn utility() -> UtilityConfig {
        UtilityConfig {
            program: "powershell.exe".to_string(),
            args: vec!["-File".to_string(), "update_manager.ps1".to_string()],
        }
    }

    #[test]
    fn action_args_appends_action_and_flags() {
        let args = action_args(&utility(), "InstallUpdates", &[("-Updates", "KB1,KB2")]);
        assert_eq!(
            args,
            vec![
                "-File",
                "update_manager.ps1",
                "-Action",
                "InstallUpdates",
                "-Updates",
                "KB1,KB2"
            ]
        );
    }

    #[test]
    fn decodes_utf16le_output() {
        let bytes: Vec<u8> = "45|60|Healthy"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        // Lone 0x00 bytes are valid UTF-8, so force the UTF-16 path with a BOM.
        let mut with_bom = vec![0xff, 0xfe];
        with_bom.extend(bytes);
        assert_eq!(decode_cmd_stdout(&with_bom), "45|60|Healthy");
    }

    #[test]
    fn strips_utf8_bom() {
        assert_eq!(decode_cmd_stdout(b"\xef\xbb\xbfKB1\n"), "KB1\n");
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = ProcessRunner
            .run("patchguard-definitely-missing-utility", &[])
            .expect_err("program should not exist");
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn captures_exit_code_and_streams() {
        let out = ProcessRunner
            .run(
                "sh",
                &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            )
            .expect("sh is available");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }
}
