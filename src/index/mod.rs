mod html;
pub mod local;
mod simple_api;
mod source;
pub mod vcs;

pub use self::simple_api::{
    fetch_project_page, parse_html_project_page, parse_json_project_page, ArtifactInfo,
    CoreMetadataRef, ProjectInfo, Yanked,
};
pub use self::source::{IndexApi, PackageId, Source, SourceDecl, SourcePriority};
pub use self::vcs::{GitCli, VcsClient};
