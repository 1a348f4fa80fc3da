use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const SEED_FILE: &str = "user.seed";
const SEED_LEN: usize = 32;

/// Proves possession of the worker's private key during connect.
pub trait NonceSigner: Send + Sync {
  fn public_key(&self) -> String;
  fn sign(&self, nonce: &[u8]) -> Vec<u8>;
}

pub struct SeedSigner {
  seed: [u8; SEED_LEN],
}

impl SeedSigner {
  pub fn from_seed(seed: [u8; SEED_LEN]) -> Self {
    Self { seed }
  }

  pub fn seed_path(dir: &Path) -> PathBuf {
    dir.join(SEED_FILE)
  }

  /// Reads `<dir>/user.seed`, generating it on first use. A seed file that
  /// does not decode to 32 bytes is replaced.
  pub async fn load_or_create(dir: &Path) -> std::io::Result<Self> {
    let path = Self::seed_path(dir);
    if let Ok(raw) = tokio::fs::read_to_string(&path).await {
      if let Some(seed) = decode_seed(raw.trim()) {
        return Ok(Self::from_seed(seed));
      }
    }

    let seed: [u8; SEED_LEN] = rand::random();
    tokio::fs::create_dir_all(dir).await?;
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&path).await?;
    file.write_all(hex::encode(seed).as_bytes()).await?;
    file.sync_all().await?;
    info!(path = %path.display(), "created signing seed");
    Ok(Self::from_seed(seed))
  }
}

fn decode_seed(raw: &str) -> Option<[u8; SEED_LEN]> {
  hex::decode(raw).ok()?.try_into().ok()
}

impl NonceSigner for SeedSigner {
  fn public_key(&self) -> String {
    hex::encode(Sha256::digest(self.seed))
  }

  fn sign(&self, nonce: &[u8]) -> Vec<u8> {
    let Ok(mut mac) = HmacSha256::new_from_slice(&self.seed) else {
      return Vec::new();
    };
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
  }
}

/// Credentials for an authenticated connect: the worker id, the queue JWT
/// issued by the control plane, and the key the JWT is bound to.
#[derive(Clone)]
pub struct ConnectIdentity {
  pub user: String,
  pub jwt: String,
  pub signer: Arc<dyn NonceSigner>,
}

impl std::fmt::Debug for ConnectIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectIdentity").field("user", &self.user).field("public_key", &self.signer.public_key()).finish()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeProof {
  pub nonce: String,
  pub public_key: String,
  pub signature: String,
}

impl ChallengeProof {
  pub fn new(signer: &dyn NonceSigner) -> Self {
    let nonce = hex::encode(rand::random::<[u8; 16]>());
    let signature = STANDARD.encode(signer.sign(nonce.as_bytes()));
    Self { nonce, public_key: signer.public_key(), signature }
  }
}

pub fn auth_url(core_base_url: &str, agent_id: &str, public_key: &str) -> String {
  format!("{}/agent_auth/{agent_id}?public_key={public_key}", core_base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn signatures_are_deterministic_per_seed() {
    let signer = SeedSigner::from_seed([7; 32]);
    assert_eq!(signer.sign(b"nonce"), signer.sign(b"nonce"));
    assert_ne!(signer.sign(b"nonce"), SeedSigner::from_seed([8; 32]).sign(b"nonce"));
    assert_eq!(signer.public_key().len(), 64);
  }

  #[test]
  fn proof_carries_the_signed_nonce() {
    let signer = SeedSigner::from_seed([1; 32]);
    let proof = ChallengeProof::new(&signer);
    assert_eq!(proof.public_key, signer.public_key());
    assert_eq!(proof.signature, STANDARD.encode(signer.sign(proof.nonce.as_bytes())));
    let other = SeedSigner::from_seed([2; 32]);
    assert_ne!(proof.signature, STANDARD.encode(other.sign(proof.nonce.as_bytes())));
    assert_ne!(proof.nonce, ChallengeProof::new(&signer).nonce);
  }

  #[test]
  fn auth_url_embeds_agent_and_key() {
    assert_eq!(
      auth_url("https://core.local/", "agent-1", "abcd"),
      "https://core.local/agent_auth/agent-1?public_key=abcd"
    );
  }

  #[tokio::test]
  async fn seed_is_created_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let first = SeedSigner::load_or_create(dir.path()).await.unwrap();
    let second = SeedSigner::load_or_create(dir.path()).await.unwrap();
    assert_eq!(first.public_key(), second.public_key());

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let mode = std::fs::metadata(SeedSigner::seed_path(dir.path())).unwrap().permissions().mode();
      assert_eq!(mode & 0o777, 0o600);
    }
  }

  #[tokio::test]
  async fn corrupt_seed_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(SeedSigner::seed_path(dir.path()), "zz").unwrap();
    let signer = SeedSigner::load_or_create(dir.path()).await.unwrap();
    let stored = std::fs::read_to_string(SeedSigner::seed_path(dir.path())).unwrap();
    assert_eq!(hex::encode(Sha256::digest(hex::decode(stored).unwrap())), signer.public_key());
  }
}
