//! Blockset entity: an ordered sequence of blocks making up a file's or a
//! metadata record's contents.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "blockset")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub full_hash: String,
    pub length: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::blockset_entry::Entity")]
    Entries,
}

impl Related<super::blockset_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Entries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
