use sea_orm::entity::prelude::*;

/// Bridge between a fileset and the files it contains.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "fileset_entry")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub fileset_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub file_id: i64,
    pub last_modified: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::fileset::Entity",
        from = "Column::FilesetId",
        to = "super::fileset::Column::Id"
    )]
    Fileset,
    #[sea_orm(
        belongs_to = "super::file_lookup::Entity",
        from = "Column::FileId",
        to = "super::file_lookup::Column::Id"
    )]
    File,
}

impl Related<super::fileset::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fileset.def()
    }
}

impl Related<super::file_lookup::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
