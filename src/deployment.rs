use crate::chain::Address;
use chrono::{
    DateTime,
    Utc,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

pub const DEPLOYMENTS_ROOT: &str = ".deployments";
const DEPLOYMENTS_FILE: &str = "deployments.json";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentEnv {
    Sepolia,
    Local,
}

impl DeploymentEnv {
    pub fn dir_name(self) -> &'static str {
        match self {
            DeploymentEnv::Sepolia => "sepolia",
            DeploymentEnv::Local => "local",
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentEnv::Sepolia => "Sepolia",
            DeploymentEnv::Local => "Local",
        };
        write!(f, "{name}")
    }
}

/// One deployed lottery contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployed_at: DateTime<Utc>,
    pub contract: Address,
    pub chain_id: u64,
    pub network_url: String,
    #[serde(default)]
    pub operator: Option<Address>,
}

/// JSON list of deployments for one environment, at
/// `<root>/<env>/deployments.json`. Read-only: records are written by the
/// deployment scripts, never by the client.
#[derive(Debug)]
pub struct DeploymentStore {
    path: PathBuf,
}

impl DeploymentStore {
    pub fn open(root: impl AsRef<Path>, env: DeploymentEnv) -> Self {
        let path = root.as_ref().join(env.dir_name()).join(DEPLOYMENTS_FILE);
        Self { path }
    }

    /// Empty when nothing has been deployed to this environment yet.
    pub fn load(&self) -> Result<Vec<DeploymentRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_records(&self.path)
    }

    /// Most recently deployed contract, if any.
    pub fn latest(&self) -> Result<Option<DeploymentRecord>> {
        let records = self.load()?;
        Ok(records.into_iter().max_by_key(|record| record.deployed_at))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_records(path: &Path) -> Result<Vec<DeploymentRecord>> {
    let data = fs::read(path)
        .wrap_err_with(|| format!("Failed to read deployment records at {}", path.display()))?;
    if data.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice::<Vec<DeploymentRecord>>(&data)
        .wrap_err("Failed to parse deployment records JSON")
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use chrono::TimeZone;
    use tempdir::TempDir;

    fn record(day: u32, contract: u8) -> DeploymentRecord {
        DeploymentRecord {
            deployed_at: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
            contract: Address::repeat_byte(contract),
            chain_id: 11_155_111,
            network_url: "https://rpc.sepolia.org".to_string(),
            operator: Some(Address::repeat_byte(0x0e)),
        }
    }

    fn write_records(store: &DeploymentStore, records: &[DeploymentRecord]) {
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), serde_json::to_vec_pretty(records).unwrap()).unwrap();
    }

    #[test]
    fn open__missing_env_dir__loads_nothing_and_creates_nothing() {
        // given
        let root = TempDir::new("deployments").unwrap();

        // when
        let store = DeploymentStore::open(root.path(), DeploymentEnv::Sepolia);

        // then
        assert!(store.path().ends_with("sepolia/deployments.json"));
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.latest().unwrap(), None);
        assert!(!root.path().join("sepolia").exists());
    }

    #[test]
    fn latest__several_records__picks_most_recent_deployment() {
        // given
        let root = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::open(root.path(), DeploymentEnv::Sepolia);
        write_records(&store, &[record(3, 0x33), record(9, 0x99), record(5, 0x55)]);

        // when
        let latest = store.latest().unwrap();

        // then
        assert_eq!(latest, Some(record(9, 0x99)));
        assert_eq!(store.load().unwrap().len(), 3);
    }

    #[test]
    fn load__record_without_operator__defaults_to_none() {
        // given
        let root = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::open(root.path(), DeploymentEnv::Local);
        fs::create_dir_all(root.path().join("local")).unwrap();
        let json = r#"[{
            "deployed_at": "2024-05-01T00:00:00Z",
            "contract": "0x5555555555555555555555555555555555555555",
            "chain_id": 31337,
            "network_url": "http://127.0.0.1:8545"
        }]"#;
        fs::write(store.path(), json).unwrap();

        // when
        let records = store.load().unwrap();

        // then
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operator, None);
        assert_eq!(records[0].contract, Address::repeat_byte(0x55));
    }

    #[test]
    fn load__corrupt_file__is_an_error() {
        // given
        let root = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::open(root.path(), DeploymentEnv::Local);
        fs::create_dir_all(root.path().join("local")).unwrap();
        fs::write(store.path(), "not json").unwrap();

        // then
        assert!(store.load().is_err());
    }
}
