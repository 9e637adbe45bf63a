use sea_orm::entity::prelude::*;

/// Recreate-only bridge: maps a single-block blockset straight to its
/// block hash so the blockset can be completed without probing a block
/// volume.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "small_blockset_link")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub blockset_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub block_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
