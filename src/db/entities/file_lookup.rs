//! Deduped file identity. Folders and symlinks use the sentinel
//! `blockset_id` values from the entities module.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "file_lookup")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub path_prefix_id: i64,
    pub name: String,
    pub blockset_id: i64,
    pub metadata_id: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::path_prefix::Entity",
        from = "Column::PathPrefixId",
        to = "super::path_prefix::Column::Id"
    )]
    Prefix,
}

impl Related<super::path_prefix::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Prefix.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
