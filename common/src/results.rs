use serde::{Deserialize, Serialize};

use crate::job::OutputFormat;

/// De qué arreglo de la petición salió un ítem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Url,
    Html,
    Item,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Url => "url",
            ItemKind::Html => "html",
            ItemKind::Item => "item",
        }
    }
}

/// Resultado de un ítem renderizado: bytes en base64 o URL del almacenamiento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub identifier: String,
    #[serde(rename = "type")]
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(rename = "ossUrl", default, skip_serializing_if = "Option::is_none")]
    pub oss_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Valor resumido del ítem (nunca el HTML completo)
    pub value: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

impl Summary {
    pub fn new(success: usize, failed: usize) -> Self {
        Self {
            total: success + failed,
            success,
            failed,
        }
    }
}

/// Foto del avance de un lote.
///
/// A mitad de ejecución `results` y `errors` sólo traen la ventana más
/// reciente; la foto final (`is_final`) trae las listas completas.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub results: Vec<ItemResult>,
    pub errors: Vec<ItemError>,
    pub is_final: bool,
}

impl Progress {
    pub fn summary(&self) -> Summary {
        Summary::new(self.completed_items, self.failed_items)
    }
}

/// Recorta `value` a `max` caracteres (no bytes) agregando "..." si hizo falta.
pub fn truncate_value(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_value_respeta_caracteres_multibyte() {
        let html = "ñ".repeat(60);
        let out = truncate_value(&html, 50);
        assert_eq!(out.chars().count(), 53);
        assert!(out.ends_with("..."));

        assert_eq!(truncate_value("<p>hola</p>", 50), "<p>hola</p>");
    }

    #[test]
    fn summary_suma_total() {
        let s = Summary::new(3, 2);
        assert_eq!(s, Summary { total: 5, success: 3, failed: 2 });
    }
}
