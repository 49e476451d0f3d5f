//! Fixtures shared by unit tests: real xlsx files, stores, recording
//! notification transports and an in-process HTTP client for the router.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request};
use axum::response::Response;
use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use quick_xml::escape::escape;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::api::create_router;
use crate::auth::hash_password;
use crate::config::Config;
use crate::db::{AdminRole, NewAdmin, NewClaim, NewDocument, NewPartner, SqliteStore, Store};
use crate::notifications::{
    ChatRecipient, ChatTransport, EmailMessage, MailTransport, NotificationService, NotifyError,
};
use crate::AppState;

const REL_BASE: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const SHEET_MAIN: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";

/// Builds a minimal but complete xlsx the way spreadsheet software lays
/// it out. Cells starting with `#` are numbers, others go to shared
/// strings, empty cells are omitted.
#[derive(Default)]
pub struct XlsxBuilder {
    sheets: Vec<(String, Vec<Vec<String>>)>,
    defined_names: Vec<(String, Option<usize>, String)>,
    active_tab: Option<usize>,
    date1904: bool,
}

impl XlsxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sheet(mut self, name: &str, rows: &[&[&str]]) -> Self {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect();
        self.sheets.push((name.to_string(), rows));
        self
    }

    pub fn defined_name(mut self, name: &str, local_sheet: Option<usize>, formula: &str) -> Self {
        self.defined_names
            .push((name.to_string(), local_sheet, formula.to_string()));
        self
    }

    pub fn active_tab(mut self, tab: usize) -> Self {
        self.active_tab = Some(tab);
        self
    }

    pub fn date1904(mut self) -> Self {
        self.date1904 = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut shared: Vec<String> = Vec::new();
        let mut sheet_parts = Vec::new();
        for (_, rows) in &self.sheets {
            sheet_parts.push(sheet_xml(rows, &mut shared));
        }
        let n = self.sheets.len();

        let mut content_types = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
        );
        for i in 1..=n {
            content_types.push_str(&format!(
                r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
                i
            ));
        }
        content_types.push_str(
            r#"<Override PartName="/xl/sharedStrings.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml"/><Override PartName="/xl/calcChain.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.calcChain+xml"/><Override PartName="/docProps/app.xml" ContentType="application/vnd.openxmlformats-officedocument.extended-properties+xml"/></Types>"#,
        );

        let root_rels = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{base}/officeDocument" Target="xl/workbook.xml"/><Relationship Id="rId2" Type="{base}/extended-properties" Target="docProps/app.xml"/></Relationships>"#,
            base = REL_BASE
        );

        let titles: String = self
            .sheets
            .iter()
            .map(|(name, _)| format!("<vt:lpstr>{}</vt:lpstr>", escape(name.as_str())))
            .collect();
        let app = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Properties xmlns="http://schemas.openxmlformats.org/officeDocument/2006/extended-properties" xmlns:vt="http://schemas.openxmlformats.org/officeDocument/2006/docPropsVTypes"><TitlesOfParts><vt:vector size="{}" baseType="lpstr">{}</vt:vector></TitlesOfParts></Properties>"#,
            n, titles
        );

        let mut workbook = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="{main}" xmlns:r="{base}"><workbookPr{date1904}/><bookViews><workbookView activeTab="{tab}"/></bookViews><sheets>"#,
            main = SHEET_MAIN,
            base = REL_BASE,
            date1904 = if self.date1904 { r#" date1904="1""# } else { "" },
            tab = self.active_tab.unwrap_or(0),
        );
        for (i, (name, _)) in self.sheets.iter().enumerate() {
            workbook.push_str(&format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                escape(name.as_str()),
                i + 1,
                i + 1
            ));
        }
        workbook.push_str("</sheets>");
        if !self.defined_names.is_empty() {
            workbook.push_str("<definedNames>");
            for (name, local, formula) in &self.defined_names {
                let local = local
                    .map(|id| format!(r#" localSheetId="{}""#, id))
                    .unwrap_or_default();
                workbook.push_str(&format!(
                    r#"<definedName name="{}"{}>{}</definedName>"#,
                    escape(name.as_str()),
                    local,
                    escape(formula.as_str())
                ));
            }
            workbook.push_str("</definedNames>");
        }
        workbook.push_str("</workbook>");

        let mut workbook_rels = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        );
        for i in 1..=n {
            workbook_rels.push_str(&format!(
                r#"<Relationship Id="rId{}" Type="{}/worksheet" Target="worksheets/sheet{}.xml"/>"#,
                i, REL_BASE, i
            ));
        }
        workbook_rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="{base}/sharedStrings" Target="sharedStrings.xml"/><Relationship Id="rId{}" Type="{base}/calcChain" Target="calcChain.xml"/></Relationships>"#,
            n + 1,
            n + 2,
            base = REL_BASE
        ));

        let strings: String = shared
            .iter()
            .map(|s| format!("<si><t>{}</t></si>", escape(s.as_str())))
            .collect();
        let shared_strings = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<sst xmlns="{}" count="{}" uniqueCount="{}">{}</sst>"#,
            SHEET_MAIN,
            shared.len(),
            shared.len(),
            strings
        );
        let calc_chain = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<calcChain xmlns="{}"><c r="A1" i="1"/></calcChain>"#,
            SHEET_MAIN
        );

        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut put = |name: &str, content: &str| {
            writer.start_file(name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        };

        put("[Content_Types].xml", &content_types);
        put("_rels/.rels", &root_rels);
        put("docProps/app.xml", &app);
        put("xl/workbook.xml", &workbook);
        put("xl/_rels/workbook.xml.rels", &workbook_rels);
        for (i, part) in sheet_parts.iter().enumerate() {
            put(&format!("xl/worksheets/sheet{}.xml", i + 1), part);
        }
        put("xl/sharedStrings.xml", &shared_strings);
        put("xl/calcChain.xml", &calc_chain);

        writer.finish().unwrap().into_inner()
    }
}

fn column_name(mut index: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap()
}

fn sheet_xml(rows: &[Vec<String>], shared: &mut Vec<String>) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="{}"><sheetData>"#,
        SHEET_MAIN
    );
    for (r, row) in rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, cell) in row.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            let reference = format!("{}{}", column_name(c), r + 1);
            if let Some(number) = cell.strip_prefix('#') {
                xml.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, reference, number));
            } else {
                let index = match shared.iter().position(|s| s == cell) {
                    Some(i) => i,
                    None => {
                        shared.push(cell.clone());
                        shared.len() - 1
                    }
                };
                xml.push_str(&format!(r#"<c r="{}" t="s"><v>{}</v></c>"#, reference, index));
            }
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

/// A claim upload: a `Report` sheet plus a `partner` sheet of key/value rows
pub fn claim_workbook(pairs: &[(&str, &str)]) -> Vec<u8> {
    let rows: Vec<[&str; 2]> = pairs.iter().map(|(k, v)| [*k, *v]).collect();
    let rows: Vec<&[&str]> = rows.iter().map(|r| r.as_slice()).collect();
    XlsxBuilder::new()
        .sheet("Report", &[&["Service", "Amount"], &["Consulting", "#50000"]])
        .sheet("partner", &rows)
        .build()
}

pub async fn memory_store() -> Arc<dyn Store> {
    Arc::new(SqliteStore::in_memory().await.unwrap())
}

/// Mail transport that keeps what it was asked to send
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    fail_with: Option<String>,
    delay: Option<Duration>,
}

impl RecordingMailer {
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    fn is_configured(&self) -> bool {
        true
    }

    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.fail_with {
            return Err(NotifyError::Transport(reason.clone()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Chat transport that keeps what it was asked to send. Handles listed in
/// `unstarted` fail the way the Bot API does for users who never wrote to
/// the bot.
#[derive(Default)]
pub struct RecordingChat {
    sent: Mutex<Vec<(ChatRecipient, String)>>,
    unstarted: Vec<String>,
}

impl RecordingChat {
    pub fn with_unstarted(handles: &[&str]) -> Self {
        Self {
            unstarted: handles.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(ChatRecipient, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingChat {
    fn is_configured(&self) -> bool {
        true
    }

    async fn send(&self, to: &ChatRecipient, html: &str) -> Result<(), NotifyError> {
        if let ChatRecipient::Handle(handle) = to {
            if self.unstarted.contains(handle) {
                return Err(NotifyError::ChatNotStarted(to.to_string()));
            }
        }
        self.sent.lock().unwrap().push((to.clone(), html.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// HTTP fixtures
// ---------------------------------------------------------------------

/// App state over an in-memory store with recording transports. The
/// returned mailer sees every email the app sends.
/// Wait for work spawned by a handler to show its effect
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

pub async fn test_state() -> (Arc<AppState>, Arc<RecordingMailer>) {
    let mut config = Config::default();
    config.auth.jwt_secret = Some("test-secret".to_string());
    config.server.frontend_url = "https://portal.example.com".to_string();

    let mail = Arc::new(RecordingMailer::default());
    let notifier = Arc::new(NotificationService::new(
        mail.clone(),
        Arc::new(RecordingChat::default()),
        Duration::from_secs(1),
        config.server.frontend_url.clone(),
    ));
    let state = AppState::new(config, memory_store().await, notifier);
    (Arc::new(state), mail)
}

/// Partner `<alias>@example.com` named after the alias in upper case.
/// Without a password the partner has not activated their account yet.
pub async fn seed_partner(state: &AppState, alias: &str, password: Option<&str>) -> i64 {
    state
        .store
        .create_partner(
            &NewPartner {
                name: alias.to_uppercase(),
                email: format!("{}@example.com", alias),
                telegram: None,
                alias: alias.to_string(),
                birth_date: None,
                password_hash: password.map(|p| hash_password(p).unwrap()),
            },
            Utc::now(),
        )
        .await
        .unwrap()
        .id
}

pub async fn seed_admin(state: &AppState, username: &str, password: &str, role: AdminRole) -> i64 {
    state
        .store
        .create_admin(
            &NewAdmin {
                username: username.to_string(),
                email: Some(format!("{}@example.com", username)),
                password_hash: hash_password(password).unwrap(),
                role,
            },
            Utc::now(),
        )
        .await
        .unwrap()
}

/// Seed an admin and return (id, bearer token)
pub async fn admin_session(state: &AppState, username: &str, role: AdminRole) -> (i64, String) {
    let id = seed_admin(state, username, "adminpass1", role).await;
    let session = state
        .auth
        .authenticate_admin(username, "adminpass1", Utc::now())
        .await
        .unwrap();
    (id, session.token)
}

/// Seed an activated partner and return (id, bearer token)
pub async fn partner_session(state: &AppState, alias: &str) -> (i64, String) {
    let id = seed_partner(state, alias, Some("secret1")).await;
    let session = state
        .auth
        .authenticate_partner(alias, "secret1", Utc::now())
        .await
        .unwrap();
    (id, session.token)
}

/// Seed a January 2026 claim with a small document and return
/// (claim id, document id). Published claims are stamped now.
pub async fn seed_claim(
    state: &AppState,
    partner_id: i64,
    amount: &str,
    filename: &str,
    published: bool,
) -> (i64, i64) {
    let now = Utc::now();
    let amount: Decimal = amount.parse().unwrap();
    let ids = state
        .store
        .create_claim_with_document(
            &NewClaim {
                partner_id,
                period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                period_end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
                amount,
                pay_amount: amount,
                tax_amount: Decimal::ZERO,
                doc_type: Some("act".to_string()),
                full_name: None,
                currency: "RUB".to_string(),
                created_at: now,
            },
            &NewDocument {
                filename: filename.to_string(),
                content: format!("content of {}", filename).into_bytes(),
                mime_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
            },
            now,
        )
        .await
        .unwrap();
    if published {
        state.store.publish_claims(&[ids.0], now).await.unwrap();
    }
    ids
}

pub async fn send(state: &Arc<AppState>, request: Request<Body>) -> Response {
    create_router(state.clone()).oneshot(request).await.unwrap()
}

fn request(method: Method, uri: &str, token: Option<&str>) -> axum::http::request::Builder {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder
}

pub async fn get(state: &Arc<AppState>, uri: &str, token: Option<&str>) -> Response {
    send(state, request(Method::GET, uri, token).body(Body::empty()).unwrap()).await
}

pub async fn delete(state: &Arc<AppState>, uri: &str, token: Option<&str>) -> Response {
    send(state, request(Method::DELETE, uri, token).body(Body::empty()).unwrap()).await
}

async fn send_json(
    state: &Arc<AppState>,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> Response {
    let request = request(method, uri, token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(state, request).await
}

pub async fn post_json(
    state: &Arc<AppState>,
    uri: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> Response {
    send_json(state, Method::POST, uri, token, body).await
}

pub async fn put_json(
    state: &Arc<AppState>,
    uri: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> Response {
    send_json(state, Method::PUT, uri, token, body).await
}

const BOUNDARY: &str = "portal-test-boundary";

/// POST a multipart form. Files are (field name, file name, content type, bytes).
pub async fn post_multipart(
    state: &Arc<AppState>,
    uri: &str,
    token: Option<&str>,
    fields: &[(&str, &str)],
    files: &[(&str, &str, &str, Vec<u8>)],
) -> Response {
    let mut body = Vec::new();
    for (name, value) in fields {
        write!(
            body,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            BOUNDARY, name, value
        )
        .unwrap();
    }
    for (name, filename, content_type, data) in files {
        write!(
            body,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            BOUNDARY, name, filename, content_type
        )
        .unwrap();
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    write!(body, "--{}--\r\n", BOUNDARY).unwrap();

    let request = request(Method::POST, uri, token)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap();
    send(state, request).await
}

pub async fn body_bytes(response: Response) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names() {
        assert_eq!(column_name(0), "A");
        assert_eq!(column_name(25), "Z");
        assert_eq!(column_name(26), "AA");
        assert_eq!(column_name(27), "AB");
    }
}
