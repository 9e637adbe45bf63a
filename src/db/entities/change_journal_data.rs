use sea_orm::entity::prelude::*;

/// NTFS change-journal bookkeeping attached to a fileset; dropped with it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "change_journal_data")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub fileset_id: i64,
    pub volume_name: String,
    pub journal_id: i64,
    pub next_usn: i64,
    pub config_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::fileset::Entity",
        from = "Column::FilesetId",
        to = "super::fileset::Column::Id"
    )]
    Fileset,
}

impl Related<super::fileset::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fileset.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
