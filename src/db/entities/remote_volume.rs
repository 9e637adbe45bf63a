//! Remote volume entity: one row per file on the remote target.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "remote_volume")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// One of `Files`, `Blocks`, `Index`.
    pub kind: String,
    /// Lifecycle state; see `remote::VolumeState`.
    pub state: String,
    pub size: i64,
    pub hash: Option<String>,
    /// Unix timestamp after which a `Deleting` volume may actually be
    /// removed from the remote; 0 means immediately.
    pub delete_grace_period: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::block::Entity")]
    Blocks,
    #[sea_orm(has_many = "super::fileset::Entity")]
    Filesets,
}

impl Related<super::block::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Blocks.def()
    }
}

impl Related<super::fileset::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Filesets.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
