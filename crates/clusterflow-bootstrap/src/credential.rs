//! Join credential issued by the main node

use crate::error::{BootstrapError, Result};
use std::fmt;

/// What a worker needs to join: API server endpoint, bootstrap token and
/// CA certificate hash. All three are opaque.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredential {
    pub endpoint: String,
    pub token: String,
    pub discovery_hash: String,
}

impl JoinCredential {
    pub fn is_empty(&self) -> bool {
        self.endpoint.is_empty() || self.token.is_empty() || self.discovery_hash.is_empty()
    }

    /// `kubeadm join` invocation for a worker
    pub fn join_command(&self) -> String {
        format!(
            "sudo kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            self.endpoint, self.token, self.discovery_hash
        )
    }
}

impl fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinCredential")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("discovery_hash", &self.discovery_hash)
            .finish()
    }
}

/// Parse the output of `kubeadm token create --print-join-command`
pub fn parse_join_command(output: &str) -> Result<JoinCredential> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("kubeadm join"))
        .ok_or_else(|| BootstrapError::InvalidCredential("no kubeadm join line".to_string()))?;

    let mut words = line.split_whitespace().skip(2);
    let mut endpoint = None;
    let mut token = None;
    let mut discovery_hash = None;

    while let Some(word) = words.next() {
        match word {
            "--token" => token = words.next(),
            "--discovery-token-ca-cert-hash" => discovery_hash = words.next(),
            flag if flag.starts_with("--") => {}
            positional if endpoint.is_none() => endpoint = Some(positional),
            _ => {}
        }
    }

    let missing = |field: &str| BootstrapError::InvalidCredential(format!("missing {}", field));
    Ok(JoinCredential {
        endpoint: endpoint.ok_or_else(|| missing("endpoint"))?.to_string(),
        token: token.ok_or_else(|| missing("token"))?.to_string(),
        discovery_hash: discovery_hash
            .ok_or_else(|| missing("discovery hash"))?
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "kubeadm join 10.0.0.10:6443 --token abcdef.0123456789abcdef \
        --discovery-token-ca-cert-hash sha256:1234abcd \n";

    #[test]
    fn test_parse_join_command() {
        let credential = parse_join_command(OUTPUT).unwrap();
        assert_eq!(credential.endpoint, "10.0.0.10:6443");
        assert_eq!(credential.token, "abcdef.0123456789abcdef");
        assert_eq!(credential.discovery_hash, "sha256:1234abcd");
        assert!(!credential.is_empty());
    }

    #[test]
    fn test_parse_skips_warnings() {
        let output = format!("W1019 12:00:00 some warning\n{}", OUTPUT);
        assert!(parse_join_command(&output).is_ok());
    }

    #[test]
    fn test_parse_rejects_incomplete_output() {
        assert!(parse_join_command("").is_err());
        assert!(parse_join_command("kubeadm join 10.0.0.10:6443 --token abc").is_err());
    }

    #[test]
    fn test_join_command_and_redaction() {
        let credential = parse_join_command(OUTPUT).unwrap();
        assert_eq!(
            credential.join_command(),
            "sudo kubeadm join 10.0.0.10:6443 --token abcdef.0123456789abcdef \
             --discovery-token-ca-cert-hash sha256:1234abcd"
        );
        assert!(!format!("{:?}", credential).contains("abcdef.0123"));
    }
}
