//! Helpers de archivos compartidos por la cola y el almacén de metadatos.

use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::error::StoreError;

/// Sufijo de los temporales que dejan las escrituras atómicas.
const TEMP_SUFFIX: &str = ".tmp";
/// Un temporal con más de esta edad es un resto huérfano.
pub(crate) const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

fn temp_path(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dir.join(format!(".{}.{}{}", name, uuid::Uuid::new_v4().simple(), TEMP_SUFFIX))
}

fn exists(path: &Path) -> Result<bool, StoreError> {
    path.try_exists().map_err(|e| StoreError::io(path, e))
}

/// Escribe `bytes` en un temporal oculto del mismo directorio y lo renombra
/// sobre `path`. Quien liste el directorio nunca ve un archivo a medias.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = temp_path(path);

    fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Reemplaza de forma atómica un archivo que ya existe, sin crearlo si no está.
///
/// Devuelve `false` si `path` ya no existe, o si al terminar el registro
/// aparece en `moved_to`: otro proceso lo movió entre el chequeo y el
/// rename, y la copia recién escrita se borra.
pub(crate) fn overwrite_existing(path: &Path, bytes: &[u8], moved_to: &Path) -> Result<bool, StoreError> {
    if !exists(path)? {
        return Ok(false);
    }

    let tmp = temp_path(path);
    fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;

    if !exists(path)? {
        let _ = fs::remove_file(&tmp);
        return Ok(false);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }

    if exists(moved_to)? {
        remove_if_exists(path)?;
        return Ok(false);
    }
    Ok(true)
}

/// Pone el mtime de `path` en ahora. `false` si el archivo ya no existe.
pub(crate) fn touch(path: &Path) -> Result<bool, StoreError> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    file.set_modified(SystemTime::now())
        .map_err(|e| StoreError::io(path, e))?;
    Ok(true)
}

/// Borra los temporales ocultos de `dir` más viejos que `limit`: restos de
/// un proceso que murió entre la escritura y el rename.
pub(crate) fn sweep_stale_temps(dir: &Path, limit: Duration) -> Result<usize, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut removed = 0;

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !(name.starts_with('.') && name.ends_with(TEMP_SUFFIX)) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .is_ok_and(|mtime| older_than(mtime, limit));
        if stale && remove_if_exists(&entry.path())? {
            removed += 1;
        }
    }

    Ok(removed)
}

/// Lee un archivo; `None` si no existe.
pub(crate) fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Borra un archivo; ya borrado cuenta como éxito.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Lista los `*.json` visibles de `dir` como (nombre sin extensión, mtime).
/// Entradas que desaparecen mientras se listan se ignoran.
pub(crate) fn list_json(dir: &Path) -> Result<Vec<(String, SystemTime)>, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut out = Vec::new();

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        out.push((stem.to_string(), modified));
    }

    Ok(out)
}

/// ¿Pasó más de `limit` desde `mtime`? Un mtime en el futuro nunca está vencido.
pub(crate) fn older_than(mtime: SystemTime, limit: Duration) -> bool {
    SystemTime::now()
        .duration_since(mtime)
        .map(|age| age > limit)
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn age_file(path: &Path, secs: u64) {
    let f = OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(SystemTime::now() - Duration::from_secs(secs))
        .unwrap();
}
