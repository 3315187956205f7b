//! Shell tool variant.
//!
//! The command template is tokenized with POSIX-like quoting rules *before*
//! `${param}` substitution, and each placeholder is replaced by the literal
//! parameter value inside its token. Execution is a direct process spawn
//! with no shell interpreter anywhere in the call chain, so shell
//! metacharacters in parameter values carry no special meaning.

use serde_json::{Map, Value};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::definitions::schema::SandboxPolicy;
use crate::errors::ToolError;
use crate::tools::render_value;

/// Tokenize a command template with POSIX-shell-like rules: whitespace
/// separates tokens, single quotes are literal, double quotes group and
/// honour backslash escapes, a bare backslash escapes the next character.
/// No expansion of any kind happens here.
pub fn tokenize(template: &str) -> Result<Vec<String>, ToolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = template.chars();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(ToolError::UnbalancedQuote {
                                template: template.to_string(),
                            });
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(ToolError::UnbalancedQuote {
                                    template: template.to_string(),
                                });
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(ToolError::UnbalancedQuote {
                                template: template.to_string(),
                            });
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => current.push('\\'),
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Replace `${name}` placeholders within a single token with the literal
/// parameter value. The result is never re-tokenized.
fn substitute_token(token: &str, params: &Map<String, Value>) -> String {
    let mut result = String::with_capacity(token.len());
    let mut rest = token;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match params.get(name) {
                    Some(value) => result.push_str(&render_value(value)),
                    None => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// Build the argument vector for a command template: tokenize first, then
/// substitute parameters into each token.
pub fn build_argv(template: &str, params: &Map<String, Value>) -> Result<Vec<String>, ToolError> {
    let tokens = tokenize(template)?;
    Ok(tokens
        .iter()
        .map(|t| substitute_token(t, params))
        .collect())
}

/// Check the executable against the sandbox allowlist. The comparison uses
/// the basename of the first token; an empty allowlist allows any
/// executable.
pub fn check_sandbox(argv: &[String], sandbox: &SandboxPolicy) -> Result<(), ToolError> {
    let Some(first) = argv.first() else {
        return Err(ToolError::EmptyCommand);
    };

    if !sandbox.enabled || sandbox.allowlisted_commands.is_empty() {
        return Ok(());
    }

    let basename = Path::new(first)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(first);

    if sandbox.allowlisted_commands.iter().any(|c| c == basename) {
        Ok(())
    } else {
        Err(ToolError::CommandNotAllowed {
            command: basename.to_string(),
        })
    }
}

/// Read a stream keeping at most `cap` bytes. The stream is drained to EOF
/// even after the cap is reached so the child never blocks on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = (cap - kept.len()).min(n);
                    kept.extend_from_slice(&buf[..take]);
                }
            }
        }
    }

    kept
}

/// Execute a shell tool: spawn the argv directly with a minimal environment,
/// stream stdout/stderr up to the sandbox cap, and enforce the wall-clock
/// limit by killing and fully reaping the child.
pub async fn execute(
    tool_name: &str,
    command: &str,
    sandbox: &SandboxPolicy,
    params: &Map<String, Value>,
) -> Result<Value, ToolError> {
    let argv = build_argv(command, params)?;
    check_sandbox(&argv, sandbox)?;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Environment is populated solely from the sandbox allowlist; the
    // inherited environment is discarded.
    for name in &sandbox.allowed_env_vars {
        if let Ok(value) = std::env::var(name) {
            cmd.env(name, value);
        }
    }

    let mut child = cmd.spawn().map_err(ToolError::SpawnFailed)?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let cap = sandbox.max_output_size;

    let run = async {
        let (out, err) = tokio::join!(read_capped(stdout, cap), read_capped(stderr, cap));
        let status = child.wait().await;
        (out, err, status)
    };

    let timeout = Duration::from_secs(sandbox.max_execution_time);
    let (out, err, status) = match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => {
            // Kill and fully reap before reporting the timeout.
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(ToolError::Timeout {
                tool: tool_name.to_string(),
                seconds: sandbox.max_execution_time,
            });
        }
    };

    let status = status.map_err(ToolError::SpawnFailed)?;
    let exit_code = status.code().unwrap_or(-1);

    Ok(serde_json::json!({
        "status": if exit_code == 0 { "success" } else { "failure" },
        "exit_code": exit_code,
        "stdout": String::from_utf8_lossy(&out),
        "stderr": String::from_utf8_lossy(&err),
    }))
}
