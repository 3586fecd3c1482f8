// [apps/server/src/services/regen.rs]
//! Hashlist file regeneration. After every committed crack batch the
//! affected hashlists get a fresh uncracked file via tmp + rename, a new
//! digest, and their per-agent sync records invalidated. This is the whole
//! cross-hashlist propagation mechanism: agents notice the digest change on
//! their next sync and re-download a file without the cracked values.

use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, instrument};
use uuid::Uuid;

use krakenhashes_db::repositories::HashRepository;
use krakenhashes_models::LM_HASH_TYPE;

use crate::state::AppState;

/// Regenerates every listed hashlist; failures are logged per list so one
/// bad list never blocks the others.
pub async fn regenerate_hashlists(state: &AppState, hashlist_ids: &[Uuid]) {
    for hashlist_id in hashlist_ids {
        if let Err(regen_error) = regenerate_one(state, *hashlist_id).await {
            error!("[REGEN]: hashlist {hashlist_id} failed: {regen_error}");
        }
    }
}

#[instrument(skip(state), fields(hashlist = %hashlist_id))]
async fn regenerate_one(state: &AppState, hashlist_id: Uuid) -> anyhow::Result<()> {
    let hashes = HashRepository::new(state.db.clone());
    let hashlist = hashes.get_hashlist(hashlist_id).await?;

    // LM lists serve distinct 16-char halves; everything else serves the
    // plain uncracked values. Both reads are ordered, so the digest only
    // changes when the content does.
    let lines = if hashlist.hash_type_id == LM_HASH_TYPE {
        hashes.uncracked_lm_halves(hashlist_id).await?
    } else {
        hashes.uncracked_values(hashlist_id).await?
    };

    let directory = state.files_root.join("hashlists");
    fs::create_dir_all(&directory).await?;
    let final_path = directory.join(format!("{hashlist_id}.hash"));
    let tmp_path = directory.join(format!("{hashlist_id}.hash.tmp"));

    let mut content = String::with_capacity(lines.iter().map(|line| line.len() + 1).sum());
    for line in &lines {
        content.push_str(line);
        content.push('\n');
    }

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, &final_path).await?;

    let digest = hex::encode(Md5::digest(content.as_bytes()));
    hashes.set_hashlist_file_md5(hashlist_id, &digest).await?;

    info!(
        "[REGEN]: hashlist {hashlist_id} regenerated ({} uncracked lines, md5 {digest})",
        lines.len()
    );
    Ok(())
}
