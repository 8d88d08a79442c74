//! HTML pages for the browser-facing routes. Markup lives in `templates/`.

use crate::quota::QuotaStatus;
use crate::settings::Limits;
use askama_axum::Template;

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub status: QuotaStatus,
}

#[derive(Template)]
#[template(path = "about.html")]
pub struct AboutTemplate {
    pub status: QuotaStatus,
    pub limits: Limits,
}

#[derive(Template)]
#[template(path = "maintenance.html")]
pub struct MaintenanceTemplate {
    pub message: String,
}

#[derive(Template)]
#[template(path = "404.html")]
pub struct NotFoundTemplate;

#[derive(Template)]
#[template(path = "500.html")]
pub struct ServerErrorTemplate;
