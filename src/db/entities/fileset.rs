//! Fileset entity: one snapshot. The user-visible backup version is the
//! zero-based index when filesets are ordered by timestamp descending.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "fileset")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub timestamp: i64,
    /// The `Files` remote volume carrying this snapshot's file-list.
    pub volume_id: i64,
    pub is_full_backup: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::remote_volume::Entity",
        from = "Column::VolumeId",
        to = "super::remote_volume::Column::Id"
    )]
    Volume,
    #[sea_orm(has_many = "super::fileset_entry::Entity")]
    Entries,
}

impl Related<super::remote_volume::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Volume.def()
    }
}

impl Related<super::fileset_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Entries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
