pub mod gpkg;
pub mod workspace;
