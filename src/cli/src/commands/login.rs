//! `cdbox login` and `cdbox logout` commands.

use std::io::{BufRead, IsTerminal, Write};

use cdbox_core::error::{BoxError, Result};
use cdbox_runtime::client::image::{registry_key, CredentialStore};
use clap::Args;

const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Registry server (defaults to Docker Hub)
    pub server: Option<String>,

    /// Username
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Password
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Take the password from STDIN
    #[arg(long = "password-stdin")]
    pub password_stdin: bool,
}

fn prompt(label: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{label}: ")?;
    stderr.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Prompt with terminal echo turned off.
fn prompt_hidden(label: &str) -> Result<String> {
    use std::os::fd::AsRawFd;

    let fd = std::io::stdin().as_raw_fd();
    // SAFETY: termios is plain data; tcgetattr fills it for a valid fd.
    let mut term: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut term) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let saved = term;
    term.c_lflag &= !libc::ECHO;
    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &term) };
    let line = prompt(label);
    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &saved) };
    eprintln!();
    line
}

fn credentials(args: &LoginArgs) -> Result<(String, String)> {
    if args.password_stdin && args.password.is_some() {
        return Err(BoxError::invalid("--password and --password-stdin are mutually exclusive"));
    }
    if args.password_stdin && args.username.is_none() {
        return Err(BoxError::invalid("must provide --username with --password-stdin"));
    }
    let username = match &args.username {
        Some(u) => u.clone(),
        None => prompt("Username")?,
    };
    if username.is_empty() {
        return Err(BoxError::invalid("username is required"));
    }
    let password = match &args.password {
        Some(p) => {
            eprintln!("WARNING! Using --password via the CLI is insecure. Use --password-stdin.");
            p.clone()
        }
        None if args.password_stdin => {
            let mut all = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut all)?;
            all.trim_end_matches(['\r', '\n']).to_string()
        }
        None => {
            if !std::io::stdin().is_terminal() {
                return Err(BoxError::invalid("cannot prompt for a password without a terminal"));
            }
            prompt_hidden("Password")?
        }
    };
    if password.is_empty() {
        return Err(BoxError::invalid("password is required"));
    }
    Ok((username, password))
}

pub async fn login(args: LoginArgs) -> Result<()> {
    let server = args.server.clone().unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
    let (username, password) = tokio::task::spawn_blocking(move || credentials(&args))
        .await
        .map_err(|e| BoxError::Other(format!("credential prompt failed: {e}")))??;
    let store = CredentialStore::default_path()?;
    store.store(&server, &username, &password)?;
    tracing::debug!(registry = %registry_key(&server), path = %store.path().display(), "stored credentials");
    println!("Login Succeeded");
    Ok(())
}

#[derive(Args, Debug)]
pub struct LogoutArgs {
    /// Registry server (defaults to Docker Hub)
    pub server: Option<String>,
}

pub async fn logout(args: LogoutArgs) -> Result<()> {
    let server = args.server.unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
    let store = CredentialStore::default_path()?;
    if store.remove(&server)? {
        println!("Removing login credentials for {}", registry_key(&server));
    } else {
        println!("Not logged in to {}", registry_key(&server));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_flag_conflicts() {
        let args = LoginArgs {
            server: None,
            username: Some("me".into()),
            password: Some("pw".into()),
            password_stdin: true,
        };
        assert_eq!(credentials(&args).unwrap_err().exit_code(), 125);
        let args = LoginArgs {
            server: None,
            username: None,
            password: None,
            password_stdin: true,
        };
        assert!(credentials(&args).is_err());
    }

    #[test]
    fn test_explicit_credentials() {
        let args = LoginArgs {
            server: Some("ghcr.io".into()),
            username: Some("me".into()),
            password: Some("pw".into()),
            password_stdin: false,
        };
        assert_eq!(credentials(&args).unwrap(), ("me".to_string(), "pw".to_string()));
    }
}
