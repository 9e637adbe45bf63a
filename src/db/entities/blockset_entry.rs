use sea_orm::entity::prelude::*;

/// Order-carrying bridge between a blockset and its blocks.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "blockset_entry")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub blockset_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub entry_index: i64,
    pub block_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::blockset::Entity",
        from = "Column::BlocksetId",
        to = "super::blockset::Column::Id"
    )]
    Blockset,
    #[sea_orm(
        belongs_to = "super::block::Entity",
        from = "Column::BlockId",
        to = "super::block::Column::Id"
    )]
    Block,
}

impl Related<super::blockset::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Blockset.def()
    }
}

impl Related<super::block::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Block.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
