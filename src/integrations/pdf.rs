use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::quote;
use crate::errors::ServiceError;

/// Public path a quote's PDF is served from.
pub fn quote_pdf_url(quote_id: Uuid) -> String {
    format!("/uploads/quotes/{}.pdf", quote_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPdf {
    pub url: String,
    pub bytes: Vec<u8>,
}

/// Produces and stores the printable form of a quote.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteRenderer: Send + Sync {
    async fn render(&self, quote: &quote::Model) -> Result<RenderedPdf, ServiceError>;
}

/// Writes single-font text PDFs to `{upload_dir}/quotes/{id}.pdf`.
#[derive(Debug, Clone)]
pub struct FilePdfRenderer {
    upload_dir: PathBuf,
}

impl FilePdfRenderer {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    pub fn path_for(&self, quote_id: Uuid) -> PathBuf {
        self.upload_dir
            .join("quotes")
            .join(format!("{}.pdf", quote_id))
    }
}

#[async_trait]
impl QuoteRenderer for FilePdfRenderer {
    #[instrument(skip(self, quote), fields(quote_id = %quote.id))]
    async fn render(&self, quote: &quote::Model) -> Result<RenderedPdf, ServiceError> {
        let bytes = render_document(&quote_lines(quote));
        let path = self.path_for(quote.id);

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ServiceError::InternalError(format!("Cannot create {}: {}", dir.display(), e))
            })?;
        }
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            ServiceError::InternalError(format!("Cannot write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), size = bytes.len(), "Quote PDF written");

        Ok(RenderedPdf {
            url: quote_pdf_url(quote.id),
            bytes,
        })
    }
}

const LINE_WIDTH: usize = 88;
const LINES_PER_PAGE: usize = 50;

fn wrap(text: &str, out: &mut Vec<String>) {
    for paragraph in text.lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            if !line.is_empty() && line.len() + word.len() + 1 > LINE_WIDTH {
                out.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        out.push(line);
    }
}

/// Text layout of a quote, top to bottom.
pub fn quote_lines(quote: &quote::Model) -> Vec<String> {
    let mut lines = vec![
        "VAIF TECH".to_string(),
        format!("Quote {}", quote.quote_number),
        format!(
            "Issued {}   Valid until {}",
            quote.issue_date.format("%Y-%m-%d"),
            quote.valid_until.format("%Y-%m-%d")
        ),
        String::new(),
        format!("Prepared for: {}", quote.client.name),
    ];
    if let Some(company) = &quote.client.company {
        lines.push(company.clone());
    }
    lines.push(quote.client.email.clone());
    lines.push(String::new());

    lines.push(format!("Project: {}", quote.project.title));
    wrap(&quote.project.description, &mut lines);
    lines.push(String::new());

    for item in &quote.items.0 {
        lines.push(format!(
            "{} x {}  @ {} = {} {}",
            item.quantity.normalize(),
            item.name,
            item.unit_price,
            item.line_total(),
            quote.currency
        ));
    }
    lines.push(String::new());
    lines.push(format!("Subtotal: {} {}", quote.subtotal, quote.currency));
    lines.push(format!("Tax: {} {}", quote.tax, quote.currency));
    if !quote.discount.is_zero() {
        lines.push(format!("Discount: -{} {}", quote.discount, quote.currency));
    }
    lines.push(format!("Total: {} {}", quote.total, quote.currency));

    if let (Some(min), Some(max)) = (quote.estimate_min, quote.estimate_max) {
        lines.push(format!("Estimated range: {} - {} {}", min, max, quote.currency));
    }
    if let Some(notes) = &quote.notes {
        lines.push(String::new());
        lines.push("Notes".to_string());
        wrap(notes, &mut lines);
    }
    if let Some(terms) = &quote.terms {
        lines.push(String::new());
        lines.push("Terms".to_string());
        wrap(terms, &mut lines);
    }
    lines
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

/// Lays `lines` out on Letter pages in Helvetica and serializes a PDF 1.4 file.
pub fn render_document(lines: &[String]) -> Vec<u8> {
    let pages: Vec<&[String]> = if lines.is_empty() {
        vec![lines]
    } else {
        lines.chunks(LINES_PER_PAGE).collect()
    };

    // 1 catalog, 2 page tree, 3 font, then a page and its content stream per page.
    let page_ids: Vec<usize> = (0..pages.len()).map(|i| 4 + i * 2).collect();
    let mut objects: Vec<String> = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            page_ids
                .iter()
                .map(|id| format!("{} 0 R", id))
                .collect::<Vec<_>>()
                .join(" "),
            pages.len()
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];

    for (page, page_id) in pages.iter().zip(&page_ids) {
        let mut content = String::from("BT\n/F1 11 Tf\n14 TL\n50 750 Td\n");
        for line in page.iter() {
            content.push_str(&format!("({}) Tj T*\n", escape(line)));
        }
        content.push_str("ET");

        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
            page_id + 1
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            content.len(),
            content
        ));
    }

    let mut out = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (index, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.push_str(&format!("{} 0 obj\n{}\nendobj\n", index + 1, body));
    }

    let xref_at = out.len();
    out.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
    for offset in offsets {
        out.push_str(&format!("{:010} 00000 n \n", offset));
    }
    out.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref_at
    ));
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_has_header_xref_and_trailer() {
        let pdf = render_document(&["Hello (world)".to_string()]);
        let text = String::from_utf8(pdf).unwrap();
        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.contains("(Hello \\(world\\)) Tj"));
        assert!(text.contains("xref\n0 6\n"));
        assert!(text.trim_end().ends_with("%%EOF"));
    }

    #[test]
    fn xref_offsets_point_at_objects() {
        let pdf = render_document(&["a".to_string(), "b".to_string()]);
        let text = String::from_utf8(pdf).unwrap();
        let xref = text.find("xref\n").unwrap();
        for (n, line) in text[xref..].lines().skip(3).take(5).enumerate() {
            let offset: usize = line[..10].parse().unwrap();
            assert!(text[offset..].starts_with(&format!("{} 0 obj", n + 1)));
        }
    }

    #[test]
    fn long_documents_span_pages() {
        let lines: Vec<String> = (0..120).map(|i| format!("line {}", i)).collect();
        let text = String::from_utf8(render_document(&lines)).unwrap();
        assert!(text.contains("/Count 3"));
    }

    #[test]
    fn non_ascii_is_replaced() {
        assert_eq!(escape("Café"), "Caf?");
    }

    #[test]
    fn wrapping_respects_width() {
        let mut out = Vec::new();
        wrap(&"word ".repeat(60), &mut out);
        assert!(out.len() > 1);
        assert!(out.iter().all(|l| l.len() <= LINE_WIDTH));
    }
}
