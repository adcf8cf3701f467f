use std::sync::{Arc, Mutex};

use convoy_client::{ClientError, ClientResult, ClientResultExt, Object, ResourceClient};
use convoy_runtime::ReconcileError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ConvoyConfig;
use crate::credentials::TokenIssuer;

pub mod ci_job;
pub mod cluster;

pub use ci_job::CiJobController;
pub use cluster::ClusterController;

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Shared by every handler. Passed down explicitly; nothing here is global.
pub struct ControllerContext {
    pub client: Arc<dyn ResourceClient>,
    pub cfg: ConvoyConfig,
    pub tokens: Arc<dyn TokenIssuer>,
    rng: Mutex<StdRng>,
}

impl ControllerContext {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        cfg: ConvoyConfig,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            client,
            cfg,
            tokens,
            rng: Mutex::new(rng),
        }
    }

    /// Lowercase alphanumeric string usable inside DNS labels.
    pub fn random_suffix(&self, len: usize) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        (0..len)
            .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect()
    }
}

/// Why a pass could not reach the desired state.
#[derive(Debug)]
enum SyncFault {
    /// Recorded in status as `error`; retrying cannot help.
    Domain(String),
    /// Worth another attempt with backoff.
    Transient(ReconcileError),
}

impl From<ClientError> for SyncFault {
    fn from(e: ClientError) -> Self {
        SyncFault::Transient(e.into())
    }
}

/// Returns the live object at `desired`'s key, creating it first if needed.
/// Losing a create race to another writer counts as success.
async fn find_or_create(client: &dyn ResourceClient, desired: &Object) -> ClientResult<Object> {
    let key = desired.key();
    if let Some(existing) = client.get(&key).await.optional()? {
        return Ok(existing);
    }
    match client.create(desired).await {
        Ok(created) => Ok(created),
        Err(ClientError::AlreadyExists(_)) => client.get(&key).await,
        Err(e) => Err(e),
    }
}
