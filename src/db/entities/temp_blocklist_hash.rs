use sea_orm::entity::prelude::*;

/// Recreate buffer: one row per block hash inside an ingested blocklist,
/// keyed by the blocklist hash and the position within it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "temp_blocklist_hash")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub blocklist_hash: String,
    pub block_hash: String,
    pub hash_index: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
