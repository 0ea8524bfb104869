use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "trustvault";
pub const APP_NAME: &str = "trustvault";

pub const STORE_FILE: &str = "otr_keystore.ofc";
pub const LEGACY_STORE_FILE: &str = "otr_keystore";
pub const TRANSFER_FILE: &str = "otr_keystore.ofcaes";
pub const SETTINGS_FILE: &str = "settings.json";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("TRUSTVAULT_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}
