use sea_orm::entity::prelude::*;

/// Pairing between an index volume and a block volume it describes.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "index_block_link")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub index_volume_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub block_volume_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
