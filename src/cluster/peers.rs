//! Out-of-band cluster peer store.
//!
//! A persisted, ordered set of cluster members mirroring the replicated
//! `cluster_nodes` table.  The JSON file is readable without the
//! consensus log, so a cold-starting node knows whom to dial before the
//! log is replayed.  Every successful mutation is persisted immediately
//! via temp-file + atomic rename, mode 0600.
//!
//! The store also holds the one-shot "first leader certificate": a
//! freshly-joined follower does not yet know any peer certificates, so
//! the leader's TLS client certificate is captured from the first
//! inbound raft-connect upgrade and consumed at most once to call the
//! leader back.  Subsequent calls use the DB-sourced certificate.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::errors::ClusterError;
use crate::tls::PeerCertificate;

/// Name of the snapshot file inside the consensus state directory.
const PEERS_FILE: &str = "cluster.json";

/// A node participating in the replicated state machine.
///
/// `addr` and `name` are each unique within the cluster.  `leader` is
/// derived from the current raft state at render time; it is stored
/// here only so the member list serialises complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterMember {
    #[serde(default)]
    pub leader: bool,
    pub addr: String,
    pub name: String,
    pub certificate: String,
}

/// Wire shape of the member list, as served by `/1.0/cluster/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberList {
    pub members: Vec<ClusterMember>,
}

/// File-backed membership cache.
pub struct PeerStore {
    path: PathBuf,
    members: Mutex<Vec<ClusterMember>>,
    first_leader_cert: Mutex<Option<PeerCertificate>>,
}

impl PeerStore {
    /// Open the peer store under `raft_dir`, loading the snapshot file
    /// when one exists.
    pub fn open(raft_dir: &Path) -> anyhow::Result<Self> {
        let path = raft_dir.join(PEERS_FILE);
        let members = match std::fs::read(&path) {
            Ok(content) => serde_json::from_slice(&content)
                .map_err(|e| anyhow::anyhow!("couldn't unmarshal peer store: {e}"))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(anyhow::anyhow!("couldn't read peer store: {err}")),
        };

        Ok(Self {
            path,
            members: Mutex::new(members),
            first_leader_cert: Mutex::new(None),
        })
    }

    /// Addresses of all known members, in stored order.
    pub fn peers(&self) -> Vec<String> {
        self.members
            .lock()
            .expect("peer store lock poisoned")
            .iter()
            .map(|m| m.addr.clone())
            .collect()
    }

    /// Snapshot of the full member list.
    pub fn members(&self) -> Vec<ClusterMember> {
        self.members.lock().expect("peer store lock poisoned").clone()
    }

    /// Look up a member by its unique name.
    pub fn member_by_name(&self, name: &str) -> Result<ClusterMember, ClusterError> {
        self.find(|m| m.name == name)
            .ok_or_else(|| ClusterError::NoSuchMember(name.to_string()))
    }

    /// Look up a member by its `host:port` address.
    pub fn member_by_addr(&self, addr: &str) -> Result<ClusterMember, ClusterError> {
        self.find(|m| m.addr == addr)
            .ok_or_else(|| ClusterError::NoSuchMember(addr.to_string()))
    }

    fn find(&self, cmp: impl Fn(&ClusterMember) -> bool) -> Option<ClusterMember> {
        self.members
            .lock()
            .expect("peer store lock poisoned")
            .iter()
            .find(|m| cmp(m))
            .cloned()
    }

    /// Append a member and persist.
    pub fn add_peer(&self, member: ClusterMember) -> anyhow::Result<()> {
        let mut members = self.members.lock().expect("peer store lock poisoned");
        members.push(member);
        persist(&self.path, &members)
    }

    /// Replace the member list and persist.
    pub fn set_members(&self, new_members: Vec<ClusterMember>) -> anyhow::Result<()> {
        let mut members = self.members.lock().expect("peer store lock poisoned");
        *members = new_members;
        persist(&self.path, &members)
    }

    /// Remove the member with the given address and persist.
    pub fn remove_by_addr(&self, addr: &str) -> anyhow::Result<()> {
        let mut members = self.members.lock().expect("peer store lock poisoned");
        members.retain(|m| m.addr != addr);
        persist(&self.path, &members)
    }

    /// Record the TLS certificate of the first inbound raft-connect
    /// caller.  Kept only until consumed.
    pub fn set_first_leader_cert(&self, cert: PeerCertificate) {
        let mut slot = self
            .first_leader_cert
            .lock()
            .expect("peer store lock poisoned");
        if slot.is_none() {
            *slot = Some(cert);
        }
    }

    /// Consume the captured first-leader certificate, if any.
    pub fn take_first_leader_cert(&self) -> Option<PeerCertificate> {
        self.first_leader_cert
            .lock()
            .expect("peer store lock poisoned")
            .take()
    }
}

/// Write the member list as JSON, atomically, mode 0600.
fn persist(path: &Path, members: &[ClusterMember]) -> anyhow::Result<()> {
    let parent = path.parent().expect("peer store path has no parent");
    std::fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer(temp.as_file(), members)?;
    temp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    temp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn member(name: &str, addr: &str) -> ClusterMember {
        ClusterMember {
            leader: false,
            addr: addr.to_string(),
            name: name.to_string(),
            certificate: format!("-----BEGIN CERTIFICATE-----\n{name}\n-----END CERTIFICATE-----\n"),
        }
    }

    #[test]
    fn test_open_empty() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::open(dir.path()).unwrap();
        assert!(store.peers().is_empty());
        assert!(matches!(
            store.member_by_name("alpha"),
            Err(ClusterError::NoSuchMember(_))
        ));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let store = PeerStore::open(dir.path()).unwrap();
            store.add_peer(member("alpha", "10.0.0.1:8443")).unwrap();
            store.add_peer(member("beta", "10.0.0.2:8443")).unwrap();
        }

        let store = PeerStore::open(dir.path()).unwrap();
        assert_eq!(store.peers(), vec!["10.0.0.1:8443", "10.0.0.2:8443"]);
        assert_eq!(store.member_by_addr("10.0.0.2:8443").unwrap().name, "beta");
    }

    #[cfg(unix)]
    #[test]
    fn test_persist_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = PeerStore::open(dir.path()).unwrap();
        store.add_peer(member("alpha", "10.0.0.1:8443")).unwrap();

        let meta = std::fs::metadata(dir.path().join(PEERS_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_set_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::open(dir.path()).unwrap();
        store
            .set_members(vec![member("alpha", "a:1"), member("beta", "b:1")])
            .unwrap();
        store.remove_by_addr("a:1").unwrap();
        assert_eq!(store.peers(), vec!["b:1"]);
    }

    #[test]
    fn test_member_json_round_trip() {
        let m = ClusterMember {
            leader: true,
            addr: "10.0.0.1:8443".into(),
            name: "alpha".into(),
            certificate: "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n".into(),
        };
        let json = serde_json::to_string(&m).unwrap();
        let back: ClusterMember = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn test_first_leader_cert_consumed_once() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::open(dir.path()).unwrap();

        store.set_first_leader_cert(PeerCertificate(vec![1, 2, 3]));
        // A second capture does not overwrite the first.
        store.set_first_leader_cert(PeerCertificate(vec![9, 9, 9]));

        assert_eq!(store.take_first_leader_cert().unwrap().0, vec![1, 2, 3]);
        assert!(store.take_first_leader_cert().is_none());
    }
}
