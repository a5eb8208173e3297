//! Root-confined file operations: browse, download, upload, delete, copy.
//!
//! Every path argument goes through the path guard before any disk access.
//! Confinement failures are Forbidden, missing arguments are BadRequest, and
//! successes redirect with the canonical relative path so the client lands
//! back on the containing directory's listing.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Redirect, Response};
use gsc_common::{OpError, paths};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::http::{AppState, HttpError};

#[derive(Deserialize)]
pub struct ExplorerQuery {
    p: Option<String>,
}

#[derive(Deserialize)]
pub struct FioQuery {
    p: Option<String>,
    d: Option<String>,
}

#[derive(Deserialize)]
pub struct FcpQuery {
    s: Option<String>,
    d: Option<String>,
}

/// One row of a directory listing.
#[derive(Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Read a directory sorted by the listing contract: directories first, then
/// case-insensitive lexical order by name.
pub fn sorted_entries(dir: &Path) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }
    entries.sort_by(|a, b| {
        (!a.is_dir, a.name.to_lowercase()).cmp(&(!b.is_dir, b.name.to_lowercase()))
    });
    Ok(entries)
}

fn browse_url(relative: &str) -> String {
    format!("/fileexplorer?p={}", urlencoding::encode(relative))
}

/// Parent of a root-relative forward-slash path; the root's parent is root.
fn parent_of(relative: &str) -> String {
    match relative.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None if relative == "." => ".".to_string(),
        None => ".".to_string(),
    }
}

/// `GET /fileexplorer?p=` — directory listing.
///
/// A stale path degrades to its nearest existing ancestor; an unsafe path
/// redirects to the root listing instead of erroring.
pub async fn file_explorer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExplorerQuery>,
) -> Result<Response, HttpError> {
    let root = &state.config.explorer.root;
    let candidate = query.p.unwrap_or_default();

    if paths::resolve(root, &candidate).is_none() {
        return Ok(Redirect::to(&browse_url(".")).into_response());
    }
    let relative = paths::climb_to_existing(root, &candidate);
    let absolute = match paths::resolve(root, &relative) {
        Some(p) => p,
        None => return Ok(Redirect::to(&browse_url(".")).into_response()),
    };
    if !absolute.is_dir() {
        // Deep link to a file: show its containing directory.
        return Ok(Redirect::to(&browse_url(&parent_of(&relative))).into_response());
    }

    let entries = sorted_entries(&absolute).map_err(OpError::Io)?;
    Ok(Html(render_listing(&relative, &entries)).into_response())
}

/// `GET /fio?p=` — streamed download.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FioQuery>,
) -> Result<Response, HttpError> {
    let root = &state.config.explorer.root;
    let candidate = query.p.ok_or(OpError::Validation("p"))?;
    let absolute = paths::resolve(root, &candidate).ok_or(OpError::UnsafePath)?;
    if absolute.is_dir() {
        return Err(OpError::UnsafePath.into());
    }

    let file = match tokio::fs::File::open(&absolute).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(OpError::NotFound.into());
        }
        Err(err) => return Err(OpError::Io(err).into()),
    };

    let mime = mime_guess::from_path(&absolute).first_or_octet_stream();
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name.replace('"', "")),
            ),
        ],
        body,
    )
        .into_response())
}

/// `POST /fio?d=` — multipart upload into a directory.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FioQuery>,
    mut multipart: Multipart,
) -> Result<Response, HttpError> {
    let root = &state.config.explorer.root;
    let candidate = query.d.ok_or(OpError::Validation("d"))?;
    let dir = paths::resolve(root, &candidate).ok_or(OpError::UnsafePath)?;
    if !dir.is_dir() {
        return Err(OpError::UnsafePath.into());
    }

    let mut stored = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| OpError::Validation("file"))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .and_then(paths::sanitize_file_name)
            .ok_or(OpError::Validation("file name is empty"))?;
        // Stream the field to disk chunk by chunk; the body is never held
        // in memory whole.
        let target = dir.join(&file_name);
        let mut out = tokio::fs::File::create(&target)
            .await
            .map_err(OpError::Io)?;
        let mut written: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|_| OpError::Validation("file"))?
        {
            out.write_all(&chunk).await.map_err(OpError::Io)?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(OpError::Io)?;
        info!(name = %file_name, bytes = written, "file uploaded");
        stored = Some(file_name);
        break;
    }
    if stored.is_none() {
        return Err(OpError::Validation("file").into());
    }

    let relative = paths::normalize(root, &candidate);
    Ok(Redirect::to(&browse_url(&relative)).into_response())
}

/// `DELETE /fio?p=` — remove a file or recursively remove a directory.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FioQuery>,
) -> Result<Response, HttpError> {
    let root = &state.config.explorer.root;
    let candidate = query.p.ok_or(OpError::Validation("p"))?;
    let absolute = paths::resolve(root, &candidate).ok_or(OpError::UnsafePath)?;
    let relative = paths::normalize(root, &candidate);
    if relative == "." {
        // Deleting the confinement root itself is never allowed.
        return Err(OpError::UnsafePath.into());
    }

    let metadata = match tokio::fs::symlink_metadata(&absolute).await {
        Ok(m) => m,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(OpError::NotFound.into());
        }
        Err(err) => return Err(OpError::Io(err).into()),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(&absolute).await.map_err(OpError::Io)?;
    } else {
        tokio::fs::remove_file(&absolute).await.map_err(OpError::Io)?;
    }
    info!(path = %relative, "entry deleted");

    Ok(Redirect::to(&browse_url(&parent_of(&relative))).into_response())
}

/// `GET /fcp?s=&d=` — copy an existing file.
///
/// The destination may be a new path or overwrite an existing file; it must
/// not be an existing directory.
pub async fn copy(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FcpQuery>,
) -> Result<Response, HttpError> {
    let root = &state.config.explorer.root;
    let source_arg = query.s.ok_or(OpError::Validation("s"))?;
    let dest_arg = query.d.ok_or(OpError::Validation("d"))?;

    let source = paths::resolve(root, &source_arg).ok_or(OpError::UnsafePath)?;
    let dest = paths::resolve(root, &dest_arg).ok_or(OpError::UnsafePath)?;

    if !source.is_file() {
        return Err(if source.exists() {
            OpError::UnsafePath.into()
        } else {
            OpError::NotFound.into()
        });
    }
    if dest.is_dir() {
        return Err(OpError::UnsafePath.into());
    }

    if let Err(err) = tokio::fs::copy(&source, &dest).await {
        warn!(error = %err, "copy failed");
        return Err(OpError::Io(err).into());
    }

    let relative = paths::normalize(root, &dest_arg);
    info!(dest = %relative, "file copied");
    Ok(Redirect::to(&browse_url(&parent_of(&relative))).into_response())
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Minimal listing page. Rendering is glue; the ordering contract and the
/// links' canonical relative paths are the parts that matter.
fn render_listing(relative: &str, entries: &[Entry]) -> String {
    let mut rows = String::new();
    if relative != "." {
        rows.push_str(&format!(
            "<tr><td><a href=\"{}\">..</a></td><td></td><td></td></tr>\n",
            html_escape(&browse_url(&parent_of(relative)))
        ));
    }
    for entry in entries {
        let child = if relative == "." {
            entry.name.clone()
        } else {
            format!("{relative}/{}", entry.name)
        };
        let name = html_escape(&entry.name);
        if entry.is_dir {
            rows.push_str(&format!(
                "<tr><td><a href=\"{}\">{name}/</a></td><td>dir</td><td></td></tr>\n",
                html_escape(&browse_url(&child)),
            ));
        } else {
            rows.push_str(&format!(
                "<tr><td><a href=\"/fio?p={}\">{name}</a></td><td>file</td><td>{}</td></tr>\n",
                html_escape(&urlencoding::encode(&child)),
                entry.size,
            ));
        }
    }
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <title>File Explorer - {path}</title></head><body>\
         <h1>{path}</h1>\
         <p><a href=\"/console\">console</a></p>\
         <table><tr><th>name</th><th>type</th><th>size</th></tr>\n{rows}</table>\
         <form method=\"post\" enctype=\"multipart/form-data\" action=\"/fio?d={dir}\">\
         <input type=\"file\" name=\"file\"><input type=\"submit\" value=\"upload\">\
         </form></body></html>",
        path = html_escape(relative),
        dir = html_escape(&urlencoding::encode(relative)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_orders_directories_first_then_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("A")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let names: Vec<String> = sorted_entries(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["A", "a.txt", "b.txt"]);
    }

    #[test]
    fn parent_of_walks_toward_root() {
        assert_eq!(parent_of("a/b/c"), "a/b");
        assert_eq!(parent_of("a"), ".");
        assert_eq!(parent_of("."), ".");
    }

    #[test]
    fn browse_url_escapes_query_value() {
        assert_eq!(browse_url("a b/c&d"), "/fileexplorer?p=a%20b%2Fc%26d");
    }

    #[test]
    fn listing_html_escapes_names() {
        let entries = vec![Entry {
            name: "<script>.txt".to_string(),
            is_dir: false,
            size: 3,
        }];
        let html = render_listing(".", &entries);
        assert!(html.contains("&lt;script&gt;.txt"));
        assert!(!html.contains("<script>.txt"));
    }
}
