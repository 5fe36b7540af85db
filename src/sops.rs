//! SOPS bridge: treats `sops` as a black box. The core never signs or
//! verifies secrets — it only asks "is this file SOPS-encrypted" and shells
//! out to decrypt when it is.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Duration;

use crate::error::CoreError;

const SNIFF_BYTES: usize = 4096;
const DECRYPT_TIMEOUT: Duration = Duration::from_secs(15);

const MARKERS: &[&str] = &["sops:", "ENC[", "AGE-ENCRYPTED"];

/// Sniff the first 4KiB of a file for a SOPS marker. Read failures are
/// treated as "not encrypted" — the caller will surface the real error the
/// next time it tries to actually read the file.
pub async fn looks_encrypted(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut buf = vec![0u8; SNIFF_BYTES];
    let n = match file.read(&mut buf).await {
        Ok(n) => n,
        Err(_) => return false,
    };
    let sample = String::from_utf8_lossy(&buf[..n]);
    MARKERS.iter().any(|m| sample.contains(m))
}

/// Read a file, decrypting through `sops` first if it looks encrypted.
/// `input_type` is passed to `sops --input-type` for formats where it can't
/// infer from the extension (e.g. a `.env` file SOPS doesn't recognize by
/// name).
pub async fn read_maybe_encrypted(
    path: &Path,
    input_type: Option<&str>,
    sops_bin: &str,
) -> Result<Vec<u8>, CoreError> {
    if !looks_encrypted(path).await {
        return tokio::fs::read(path)
            .await
            .map_err(|e| CoreError::stage_failed(format!("reading {}: {e}", path.display())));
    }

    let mut cmd = Command::new(sops_bin);
    cmd.arg("-d");
    if let Some(t) = input_type {
        cmd.args(["--input-type", t]);
    }
    cmd.arg(path);

    let output = tokio::time::timeout(DECRYPT_TIMEOUT, cmd.output())
        .await
        .map_err(|_| CoreError::decrypt_failed(format!("sops decrypt of {} timed out", path.display())))?
        .map_err(|e| CoreError::decrypt_failed(format!("running sops: {e}")))?;

    if !output.status.success() {
        return Err(CoreError::decrypt_failed(format!(
            "sops -d {} exited with {}: {}",
            path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(output.stdout)
}

/// Decrypt (if needed) a dotenv file, strip `sops_`-prefixed metadata keys
/// (case-insensitive), and normalize a leading `export` on each line.
pub async fn read_dotenv(path: &Path, sops_bin: &str) -> Result<String, CoreError> {
    let raw = read_maybe_encrypted(path, Some("dotenv"), sops_bin).await?;
    let text = String::from_utf8(raw)
        .map_err(|e| CoreError::decrypt_failed(format!("{} is not valid utf-8: {e}", path.display())))?;
    Ok(normalize_dotenv(&text))
}

fn normalize_dotenv(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.to_ascii_lowercase().starts_with("sops_")
        })
        .map(|line| {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("export ") {
                rest
            } else if let Some(rest) = trimmed.strip_prefix("export\t") {
                rest
            } else {
                trimmed
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_sops_keys_and_export() {
        let input = "export FOO=bar\nsops_version=3.8.1\nBAZ=qux\nSOPS_KMS_ARN=x\n";
        let out = normalize_dotenv(input);
        assert_eq!(out, "FOO=bar\nBAZ=qux");
    }

    #[tokio::test]
    async fn looks_encrypted_detects_age_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.env");
        tokio::fs::write(&path, "# AGE-ENCRYPTED\nDATA=abc\n").await.unwrap();
        assert!(looks_encrypted(&path).await);
    }

    #[tokio::test]
    async fn looks_encrypted_false_for_plain_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.env");
        tokio::fs::write(&path, "FOO=bar\n").await.unwrap();
        assert!(!looks_encrypted(&path).await);
    }

    #[tokio::test]
    async fn read_maybe_encrypted_passes_through_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.env");
        tokio::fs::write(&path, "FOO=bar\n").await.unwrap();
        let data = read_maybe_encrypted(&path, Some("dotenv"), "sops").await.unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), "FOO=bar\n");
    }
}
