use sea_orm::entity::prelude::*;

/// A blockset holding one serialised metadata record.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "metadataset")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub blockset_id: i64,
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
