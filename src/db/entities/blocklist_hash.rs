use sea_orm::entity::prelude::*;

/// Hash-of-hashes chunk for blocksets with more than one block.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "blocklist_hash")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub blockset_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub hash_index: i64,
    pub hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::blockset::Entity",
        from = "Column::BlocksetId",
        to = "super::blockset::Column::Id"
    )]
    Blockset,
}

impl Related<super::blockset::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Blockset.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
