use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::results::{truncate_value, ItemKind};

/// Máximo de caracteres de HTML que se guardan al reportar un error.
pub const HTML_ERROR_PREVIEW: usize = 50;
/// Máximo de caracteres del JSON de un item al reportar un error.
pub const ITEM_ERROR_PREVIEW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Pdf,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Pdf => "pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Pdf => "application/pdf",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "pdf" => Ok(OutputFormat::Pdf),
            _ => Err(ValidationError::Format),
        }
    }
}

// Acepta "PNG", "Pdf", etc.
impl<'de> Deserialize<'de> for OutputFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Opciones de render. Todos los campos son opcionales para que el mismo
/// tipo sirva de valores por defecto de la tarea y de sobrescritura por item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<WindowSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_page: Option<bool>,
    /// Espera artificial en milisegundos
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until_network_idle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_background: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_images: Option<bool>,

    /// Sólo PDF
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landscape: Option<bool>,

    #[serde(rename = "uploadToOSS", default, skip_serializing_if = "Option::is_none")]
    pub upload_to_oss: Option<bool>,
    #[serde(rename = "ossObjectName", default, skip_serializing_if = "Option::is_none")]
    pub oss_object_name: Option<String>,
}

impl RenderOptions {
    /// Combina campo a campo: lo que trae `item` gana sobre `self`.
    pub fn overlay(&self, item: &RenderOptions) -> RenderOptions {
        RenderOptions {
            format: item.format.or(self.format),
            window_size: item.window_size.or(self.window_size),
            device: item.device.clone().or_else(|| self.device.clone()),
            full_page: item.full_page.or(self.full_page),
            delay: item.delay.or(self.delay),
            wait_until_network_idle: item.wait_until_network_idle.or(self.wait_until_network_idle),
            user_agent: item.user_agent.clone().or_else(|| self.user_agent.clone()),
            mobile: item.mobile.or(self.mobile),
            touch: item.touch.or(self.touch),
            hide_background: item.hide_background.or(self.hide_background),
            disable_images: item.disable_images.or(self.disable_images),
            pdf_format: item.pdf_format.clone().or_else(|| self.pdf_format.clone()),
            landscape: item.landscape.or(self.landscape),
            upload_to_oss: item.upload_to_oss.or(self.upload_to_oss),
            oss_object_name: item
                .oss_object_name
                .clone()
                .or_else(|| self.oss_object_name.clone()),
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        self.format.unwrap_or(OutputFormat::Png)
    }

    pub fn wants_upload(&self) -> bool {
        self.upload_to_oss.unwrap_or(false)
    }

    /// Validación local, antes de invocar al motor.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(ws) = self.window_size {
            if ws.width == 0 || ws.height == 0 {
                return Err(ValidationError::WindowSize);
            }
        }
        let strings = [
            ("device", &self.device),
            ("userAgent", &self.user_agent),
            ("pdfFormat", &self.pdf_format),
            ("ossObjectName", &self.oss_object_name),
        ];
        for (name, value) in strings {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(ValidationError::Empty(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "content", rename_all = "lowercase")]
pub enum RenderSource {
    Url(String),
    Html(String),
}

impl RenderSource {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderSource::Url(_) => "url",
            RenderSource::Html(_) => "html",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            RenderSource::Url(s) | RenderSource::Html(s) => s,
        }
    }
}

/// Un item estructurado de `items[]`, o el cuerpo de un render individual.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(flatten)]
    pub options: RenderOptions,
}

impl RenderItem {
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        Self::deserialize(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// La url tiene prioridad sobre el html, igual que en un render individual.
    pub fn source(&self) -> Result<RenderSource, ValidationError> {
        match (&self.url, &self.html) {
            (Some(url), _) if !url.trim().is_empty() => Ok(RenderSource::Url(url.clone())),
            (_, Some(html)) if !html.is_empty() => Ok(RenderSource::Html(html.clone())),
            _ => Err(ValidationError::MissingSource),
        }
    }
}

/// Cuerpo de una tarea por lotes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub htmls: Vec<String>,
    /// Se guardan crudos: un item mal formado es un error de ese item, no del lote
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Value>,
    #[serde(flatten)]
    pub options: RenderOptions,
}

/// Un trabajo de render ya resuelto dentro de una tarea.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub index: usize,
    pub kind: ItemKind,
    /// Representación segura para reportar errores
    pub value: String,
    pub input: Result<(RenderSource, RenderOptions), ValidationError>,
}

impl RenderJob {
    pub fn identifier(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.index)
    }
}

impl RenderRequest {
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        Self::deserialize(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn item_count(&self) -> usize {
        self.urls.len() + self.htmls.len() + self.items.len()
    }

    /// Validación de entrada para el endpoint de envío.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.item_count() == 0 {
            return Err(ValidationError::NoItems);
        }
        self.options.validate()
    }

    /// Expande urls, htmls e items (en ese orden) en trabajos individuales.
    pub fn expand(&self) -> Vec<RenderJob> {
        let mut jobs = Vec::with_capacity(self.item_count());

        for (index, url) in self.urls.iter().enumerate() {
            let source = if url.trim().is_empty() {
                Err(ValidationError::MissingSource)
            } else {
                Ok((RenderSource::Url(url.clone()), self.options.clone()))
            };
            jobs.push(RenderJob {
                index,
                kind: ItemKind::Url,
                value: url.clone(),
                input: source,
            });
        }

        for (index, html) in self.htmls.iter().enumerate() {
            let source = if html.is_empty() {
                Err(ValidationError::MissingSource)
            } else {
                Ok((RenderSource::Html(html.clone()), self.options.clone()))
            };
            jobs.push(RenderJob {
                index,
                kind: ItemKind::Html,
                value: truncate_value(html, HTML_ERROR_PREVIEW),
                input: source,
            });
        }

        for (index, raw) in self.items.iter().enumerate() {
            let input = RenderItem::deserialize(raw)
                .map_err(|e| ValidationError::Malformed(e.to_string()))
                .and_then(|item| {
                    let source = item.source()?;
                    Ok((source, self.options.overlay(&item.options)))
                });
            jobs.push(RenderJob {
                index,
                kind: ItemKind::Item,
                value: truncate_value(&raw.to_string(), ITEM_ERROR_PREVIEW),
                input,
            });
        }

        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expand_respeta_orden_urls_htmls_items() {
        let req = RenderRequest::from_value(&json!({
            "urls": ["https://a", "https://b"],
            "htmls": ["<p>x</p>"],
            "items": [{"url": "https://c"}],
        }))
        .unwrap();

        let ids: Vec<String> = req.expand().iter().map(|j| j.identifier()).collect();
        assert_eq!(ids, vec!["url_0", "url_1", "html_0", "item_0"]);
    }

    #[test]
    fn item_sobrescribe_opciones_de_la_tarea() {
        let req = RenderRequest::from_value(&json!({
            "format": "pdf",
            "fullPage": true,
            "userAgent": "base-agent",
            "items": [{"html": "<b>hola</b>", "format": "PNG", "userAgent": "item-agent"}],
        }))
        .unwrap();

        let jobs = req.expand();
        let (source, opts) = jobs[0].input.clone().unwrap();
        assert_eq!(source, RenderSource::Html("<b>hola</b>".into()));
        assert_eq!(opts.output_format(), OutputFormat::Png);
        assert_eq!(opts.user_agent.as_deref(), Some("item-agent"));
        // lo que el item no trae viene de la tarea
        assert_eq!(opts.full_page, Some(true));
    }

    #[test]
    fn item_mal_formado_queda_como_error_del_item() {
        let req = RenderRequest::from_value(&json!({
            "items": [{"url": "https://ok"}, {"url": "https://x", "fullPage": "si"}, {"delay": 5}],
        }))
        .unwrap();

        let jobs = req.expand();
        assert!(jobs[0].input.is_ok());
        assert!(matches!(jobs[1].input, Err(ValidationError::Malformed(_))));
        assert_eq!(jobs[2].input, Err(ValidationError::MissingSource));
        assert!(jobs[1].value.contains("https://x"));
    }

    #[test]
    fn item_no_hereda_la_url_de_la_tarea() {
        let req = RenderRequest::from_value(&json!({
            "url": "https://tarea",
            "items": [{"html": "<i>solo html</i>"}],
        }))
        .unwrap();

        let (source, _) = req.expand()[0].input.clone().unwrap();
        assert_eq!(source.kind(), "html");
    }

    #[test]
    fn html_largo_se_resume_en_el_valor() {
        let html = format!("<div>{}</div>", "x".repeat(200));
        let req = RenderRequest {
            htmls: vec![html],
            ..Default::default()
        };
        let job = &req.expand()[0];
        assert_eq!(job.value.chars().count(), HTML_ERROR_PREVIEW + 3);
    }

    #[test]
    fn validate_rechaza_window_size_cero_y_formato_desconocido() {
        let opts = RenderOptions {
            window_size: Some(WindowSize { width: 0, height: 600 }),
            ..Default::default()
        };
        assert_eq!(opts.validate(), Err(ValidationError::WindowSize));

        let err = RenderRequest::from_value(&json!({"urls": ["https://a"], "format": "gif"}));
        assert!(matches!(err, Err(ValidationError::Malformed(_))));
    }

    #[test]
    fn validate_exige_al_menos_un_item() {
        let req = RenderRequest::default();
        assert_eq!(req.validate(), Err(ValidationError::NoItems));
    }

    #[test]
    fn opciones_usan_nombres_del_cliente() {
        let opts: RenderOptions = serde_json::from_value(json!({
            "windowSize": {"width": 800, "height": 600},
            "waitUntilNetworkIdle": true,
            "uploadToOSS": true,
            "ossObjectName": "a/b.png",
        }))
        .unwrap();
        assert!(opts.wants_upload());
        assert_eq!(opts.wait_until_network_idle, Some(true));
        assert_eq!(opts.oss_object_name.as_deref(), Some("a/b.png"));
    }
}
