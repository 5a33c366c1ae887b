use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{get_json_lenient, keys, put_json, Domain, KvStore};

/// Load the installation's device identifier, creating it on first use.
///
/// `store` must be separate from the main store: the identifier binds
/// integrity fingerprints to this installation and has to survive a wipe of
/// the main store. It is not an identity or a secret.
pub async fn load_or_create_device_id(store: &dyn KvStore) -> Result<String> {
    if let Some(id) = get_json_lenient::<String>(store, Domain::Durable, keys::DEVICE_ID).await? {
        if Uuid::parse_str(&id).is_ok() {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4().to_string();
    put_json(store, Domain::Durable, keys::DEVICE_ID, &id).await?;
    info!(device_id = %id, "generated new device identifier");
    Ok(id)
}
