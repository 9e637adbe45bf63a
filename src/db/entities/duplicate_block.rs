//! An additional physical copy of a block, produced during compaction.
//! The primary copy stays in `block.volume_id`; a duplicate is never in
//! the same volume as the primary.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "duplicate_block")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub block_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub volume_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::block::Entity",
        from = "Column::BlockId",
        to = "super::block::Column::Id"
    )]
    Block,
}

impl Related<super::block::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Block.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
