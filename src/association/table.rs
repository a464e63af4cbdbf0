//! sled-backed association table

use super::Association;
use crate::error::{Error, Result};
use tracing::debug;
use uuid::Uuid;

const ASSOCIATIONS_TREE: &str = "associations";

/// Association rows keyed by id, replaced on every change
#[derive(Clone)]
pub struct AssociationTable {
    tree: sled::Tree,
}

impl AssociationTable {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(AssociationTable {
            tree: db.open_tree(ASSOCIATIONS_TREE)?,
        })
    }

    pub fn put(&self, association: &Association) -> Result<()> {
        let bytes = bincode::serialize(association)?;
        self.tree.insert(association.id.as_bytes(), bytes)?;
        self.tree.flush()?;
        debug!(association = %association.id, state = %association.state, "association saved");
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Association> {
        let bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or(Error::AssociationNotFound(id))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn list(&self) -> Result<Vec<Association>> {
        self.tree
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                Ok(bincode::deserialize(&bytes)?)
            })
            .collect()
    }

    pub fn remove(&self, id: Uuid) -> Result<()> {
        self.tree.remove(id.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationConfig, AssociationState, SyncMode};
    use crate::provider::{Instance, InstanceRole, InstanceStatus};
    use chrono::Utc;

    fn instance(id: &str, role: InstanceRole) -> Instance {
        Instance {
            id: id.to_string(),
            provider: "mem".into(),
            role,
            address: "10.0.0.2".into(),
            region: "eu-west-1".into(),
            status: InstanceStatus::Running,
        }
    }

    #[test]
    fn test_put_get_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("state.db")).unwrap();
        let table = AssociationTable::open(&db).unwrap();

        let mut association = Association::new(
            instance("p-1", InstanceRole::Primary),
            instance("b-1", InstanceRole::Backup),
            SyncMode::Realtime,
            "eu-west-1".into(),
            &AssociationConfig::default(),
            Utc::now(),
        );
        table.put(&association).unwrap();

        association
            .transition(AssociationState::Syncing, Utc::now())
            .unwrap();
        table.put(&association).unwrap();

        assert_eq!(table.get(association.id).unwrap(), association);
        assert_eq!(table.list().unwrap().len(), 1);

        table.remove(association.id).unwrap();
        assert!(matches!(
            table.get(association.id),
            Err(Error::AssociationNotFound(_))
        ));
    }
}
