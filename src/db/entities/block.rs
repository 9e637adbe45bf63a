//! Block entity: a unique `(hash, size)` pair stored exactly once in a
//! remote block volume.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "block")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub hash: String,
    pub size: i64,
    /// Volume holding the primary copy; -1 while the location is unknown
    /// (mid-recreate).
    pub volume_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::remote_volume::Entity",
        from = "Column::VolumeId",
        to = "super::remote_volume::Column::Id"
    )]
    Volume,
}

impl Related<super::remote_volume::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Volume.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
