use std::io;
use std::path::Path;

use tonic::Status;

use crate::proto::{
    DirEntry, ListDirRequest, ListDirResponse, MakeDirRequest, ReadFileRequest, ReadFileResponse,
    RemoveRequest, WriteFileRequest, WriteFileResponse, WriteFilesRequest, WriteFilesResponse,
};

fn require_absolute(path: &str) -> Result<(), Status> {
    if !path.starts_with('/') {
        return Err(Status::invalid_argument(format!(
            "path must be absolute: {path}"
        )));
    }
    Ok(())
}

fn map_io_error(err: io::Error, path: &str) -> Status {
    match err.kind() {
        io::ErrorKind::NotFound => Status::not_found(format!("file not found: {path}")),
        io::ErrorKind::PermissionDenied => {
            Status::permission_denied(format!("permission denied: {path}"))
        }
        _ => Status::internal(format!("{path}: {err}")),
    }
}

pub async fn read_file(request: ReadFileRequest) -> Result<ReadFileResponse, Status> {
    require_absolute(&request.path)?;
    let content = tokio::fs::read(&request.path)
        .await
        .map_err(|e| map_io_error(e, &request.path))?;
    Ok(ReadFileResponse { content })
}

/// Write a file, creating parent directories implicitly.
pub async fn write_file(request: WriteFileRequest) -> Result<WriteFileResponse, Status> {
    require_absolute(&request.path)?;

    if let Some(parent) = Path::new(&request.path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| map_io_error(e, &request.path))?;
    }

    tokio::fs::write(&request.path, &request.content)
        .await
        .map_err(|e| map_io_error(e, &request.path))?;

    Ok(WriteFileResponse {
        bytes_written: request.content.len() as u64,
    })
}

pub async fn write_files(request: WriteFilesRequest) -> Result<WriteFilesResponse, Status> {
    let mut files_written = 0u32;
    for file in request.files {
        write_file(file).await?;
        files_written += 1;
    }
    Ok(WriteFilesResponse { files_written })
}

pub async fn list_dir(request: ListDirRequest) -> Result<ListDirResponse, Status> {
    require_absolute(&request.path)?;
    let path = Path::new(&request.path);

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| map_io_error(e, &request.path))?;
    if !meta.is_dir() {
        return Err(Status::invalid_argument(format!(
            "path is not a directory: {}",
            request.path
        )));
    }

    let mut read_dir = tokio::fs::read_dir(path)
        .await
        .map_err(|e| map_io_error(e, &request.path))?;

    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| map_io_error(e, &request.path))?
    {
        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue, // entry vanished or unstattable
        };
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        entries.push(DirEntry {
            path: entry.path().to_string_lossy().into_owned(),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            modified_at,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(ListDirResponse { entries })
}

pub async fn make_dir(request: MakeDirRequest) -> Result<(), Status> {
    require_absolute(&request.path)?;
    tokio::fs::create_dir_all(&request.path)
        .await
        .map_err(|e| map_io_error(e, &request.path))
}

/// Remove a file or a directory tree.
pub async fn remove(request: RemoveRequest) -> Result<(), Status> {
    require_absolute(&request.path)?;
    let meta = tokio::fs::metadata(&request.path)
        .await
        .map_err(|e| map_io_error(e, &request.path))?;

    if meta.is_dir() {
        tokio::fs::remove_dir_all(&request.path)
            .await
            .map_err(|e| map_io_error(e, &request.path))
    } else {
        tokio::fs::remove_file(&request.path)
            .await
            .map_err(|e| map_io_error(e, &request.path))
    }
}
