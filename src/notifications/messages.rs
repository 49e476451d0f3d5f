//! Message bodies for partner and operator notifications.
//!
//! Every message comes in an email form (subject, plain text, HTML) and,
//! where a chat copy is sent, a Telegram HTML form.

use chrono::NaiveDate;
use quick_xml::escape::partial_escape;

use super::EmailMessage;

/// One newly published document in a digest
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLine {
    pub file_name: String,
    /// `DD.MM.YYYY - DD.MM.YYYY`
    pub period: String,
    pub amount: String,
    pub currency: String,
}

fn esc(text: &str) -> String {
    partial_escape(text).into_owned()
}

fn html_page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 0; padding: 20px; background-color: #f5f5f5; }}
        .container {{ max-width: 600px; margin: 0 auto; background-color: #ffffff; border-radius: 8px; overflow: hidden; }}
        .header {{ background-color: #1f2937; color: white; padding: 20px; text-align: center; }}
        .content {{ padding: 20px; color: #374151; line-height: 1.6; }}
        .button {{ display: inline-block; padding: 12px 24px; background-color: #2563eb; color: #ffffff; text-decoration: none; border-radius: 6px; }}
        table {{ width: 100%; border-collapse: collapse; }}
        td, th {{ padding: 8px; border-bottom: 1px solid #e5e7eb; text-align: left; }}
        .footer {{ padding: 15px; text-align: center; color: #888; font-size: 12px; border-top: 1px solid #eee; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="header"><h1>{title}</h1></div>
        <div class="content">{body}</div>
        <div class="footer">Partner Portal</div>
    </div>
</body>
</html>
"#,
        title = esc(title),
        body = body,
    )
}

pub fn documents_published_email(
    to: &str,
    partner_name: &str,
    documents: &[DocumentLine],
    portal_url: &str,
) -> EmailMessage {
    let subject = format!("New documents published ({})", documents.len());

    let mut text = format!(
        "Hello, {}!\n\n{} new document(s) are available in your account:\n\n",
        partner_name,
        documents.len()
    );
    for (i, doc) in documents.iter().enumerate() {
        text.push_str(&format!(
            "{}. {} - {} - {} {}\n",
            i + 1,
            doc.file_name,
            doc.period,
            doc.amount,
            doc.currency
        ));
    }
    text.push_str(&format!("\nOpen the portal: {}\n", portal_url));

    let rows: String = documents
        .iter()
        .map(|doc| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{} {}</td></tr>",
                esc(&doc.file_name),
                esc(&doc.period),
                esc(&doc.amount),
                esc(&doc.currency)
            )
        })
        .collect();
    let body = format!(
        r#"<p>Hello, {name}!</p>
<p>New documents are available in your account:</p>
<table><tr><th>File</th><th>Period</th><th>Amount</th></tr>{rows}</table>
<p><a class="button" href="{url}">Open the portal</a></p>"#,
        name = esc(partner_name),
        rows = rows,
        url = esc(portal_url),
    );

    EmailMessage {
        to: to.to_string(),
        subject,
        text,
        html: html_page("New documents published", &body),
    }
}

pub fn documents_published_chat(partner_name: &str, documents: &[DocumentLine], portal_url: &str) -> String {
    let list = documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "{}. <b>{}</b>\n   {} • {} {}",
                i + 1,
                esc(&doc.file_name),
                esc(&doc.period),
                esc(&doc.amount),
                esc(&doc.currency)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "<b>New documents published</b>\n\n<b>Partner:</b> {}\n<b>Documents:</b> {}\n\n{}\n\n<a href=\"{}\">Open the portal</a>",
        esc(partner_name),
        documents.len(),
        list,
        esc(portal_url)
    )
}

pub fn password_reset_email(to: &str, partner_name: &str, link: &str, ttl_minutes: i64) -> EmailMessage {
    let text = format!(
        "Hello, {}!\n\nA password reset was requested for your account.\nSet a new password here: {}\n\nThe link expires in {} minutes. If you did not ask for this, ignore this message.\n",
        partner_name, link, ttl_minutes
    );
    let body = format!(
        r#"<p>Hello, {name}!</p>
<p>A password reset was requested for your account.</p>
<p><a class="button" href="{link}">Set a new password</a></p>
<p>The link expires in {ttl} minutes. If you did not ask for this, ignore this message.</p>"#,
        name = esc(partner_name),
        link = esc(link),
        ttl = ttl_minutes,
    );

    EmailMessage {
        to: to.to_string(),
        subject: "Password reset".to_string(),
        text,
        html: html_page("Password reset", &body),
    }
}

pub fn password_reset_chat(partner_name: &str, link: &str, ttl_minutes: i64) -> String {
    format!(
        "<b>Password reset</b>\n\n{}, use this link to set a new password:\n<a href=\"{}\">Set a new password</a>\n\n<i>The link expires in {} minutes.</i>",
        esc(partner_name),
        esc(link),
        ttl_minutes
    )
}

pub fn invitation_email(to: &str, partner_name: &str, alias: &str, link: &str) -> EmailMessage {
    let text = format!(
        "Hello, {}!\n\nAn account has been created for you in the partner portal.\nYour login: {}\nSet your password here: {}\n",
        partner_name, alias, link
    );
    let body = format!(
        r#"<p>Hello, {name}!</p>
<p>An account has been created for you in the partner portal.</p>
<p>Your login: <b>{alias}</b></p>
<p><a class="button" href="{link}">Set your password</a></p>"#,
        name = esc(partner_name),
        alias = esc(alias),
        link = esc(link),
    );

    EmailMessage {
        to: to.to_string(),
        subject: "Welcome to the partner portal".to_string(),
        text,
        html: html_page("Welcome", &body),
    }
}

pub fn invitation_chat(partner_name: &str, alias: &str, link: &str) -> String {
    format!(
        "<b>Welcome to the partner portal</b>\n\n{}, your login is <code>{}</code>.\n<a href=\"{}\">Set your password</a>",
        esc(partner_name),
        esc(alias),
        esc(link)
    )
}

pub fn birthday_digest_chat(names: &[String], today: NaiveDate) -> String {
    let list = names
        .iter()
        .map(|name| format!("• {}", esc(name)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "<b>Birthdays today, {}</b>\n\n{}\n\nTotal: {}",
        today.format("%d.%m.%Y"),
        list,
        names.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(name: &str) -> DocumentLine {
        DocumentLine {
            file_name: name.to_string(),
            period: "01.01.2026 - 31.01.2026".to_string(),
            amount: "50000.00".to_string(),
            currency: "RUB".to_string(),
        }
    }

    #[test]
    fn test_digest_lists_every_document() {
        let docs = vec![line("a.xlsx"), line("b.xlsx")];
        let email = documents_published_email("p@example.com", "Acme", &docs, "https://portal");
        assert_eq!(email.subject, "New documents published (2)");
        assert!(email.text.contains("1. a.xlsx - 01.01.2026 - 31.01.2026"));
        assert!(email.text.contains("2. b.xlsx"));
        assert!(email.html.contains("<td>b.xlsx</td>"));

        let chat = documents_published_chat("Acme", &docs, "https://portal");
        assert!(chat.contains("<b>Documents:</b> 2"));
    }

    #[test]
    fn test_markup_in_names_is_escaped() {
        let chat = documents_published_chat("A <b> & Co", &[line("x<y>.xlsx")], "https://portal");
        assert!(chat.contains("A &lt;b&gt; &amp; Co"));
        assert!(chat.contains("x&lt;y&gt;.xlsx"));
    }

    #[test]
    fn test_birthday_digest() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let text = birthday_digest_chat(&["Acme".to_string(), "Beta".to_string()], today);
        assert!(text.contains("01.03.2026"));
        assert!(text.contains("• Beta"));
        assert!(text.ends_with("Total: 2"));
    }
}
