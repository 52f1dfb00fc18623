//! HTTP side calls: the login token and the profile/style fetches.
//!
//! One lazily-created client is shared by the whole process. Profile pages
//! are stored as opaque text; only the message-style JSON and the background
//! descriptor attributes are interpreted.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::model::User;
use crate::Result;

const LOGIN_URL: &str = "http://chatango.com/login";
const AUTH_COOKIE: &str = "auth.chatango.com";
const UST_BASE: &str = "http://ust.chatango.com/profileimg";

static HTTP: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .build()
        .expect("Couldn't build the shared reqwest client")
});

static XML_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(\w+)="(.*?)""#).unwrap());

/// Log in over HTTP and pull the session token out of the auth cookie.
/// Returns `None` when the credentials were rejected.
pub async fn get_token(user_name: &str, password: &str) -> Result<Option<String>> {
    let user_id = user_name.to_lowercase();
    let response = HTTP
        .post(LOGIN_URL)
        .form(&[
            ("user_id", user_id.as_str()),
            ("password", password),
            ("storecookie", "on"),
            ("checkerrors", "yes"),
        ])
        .send()
        .await?;
    let token = response
        .cookies()
        .find(|cookie| cookie.name() == AUTH_COOKIE)
        .map(|cookie| cookie.value().to_owned());
    Ok(token)
}

/// Fetch and apply a user's message styles and background descriptor.
pub(crate) async fn fetch_styles(user: &User) -> Result<()> {
    if user.is_anon() {
        return Ok(());
    }
    let dir = user_dir(user.name());

    if let Some(xml) = fetch_text(&format!("{}{}msgbg.xml", UST_BASE, dir)).await? {
        let attributes: Vec<(String, String)> = XML_ATTR
            .captures_iter(&xml)
            .map(|caps| (caps[1].to_owned(), caps[2].to_owned()))
            .collect();
        user.update_styles(|styles| {
            for (key, value) in attributes {
                styles.bg_style.insert(key, value);
            }
            if let Some(align) = styles.bg_style.get("align").cloned() {
                if let Some(position) = align_position(&align) {
                    styles.bg_style.insert("align".to_owned(), position.to_owned());
                }
            }
        });
    }

    if let Some(json) = fetch_text(&format!("{}{}msgstyles.json", UST_BASE, dir)).await? {
        if let Ok(doc) = serde_json::from_str::<MessageStyles>(&json) {
            user.update_styles(|styles| {
                if let Some(color) = as_text(&doc.name_color) {
                    styles.name_color = color;
                }
                if let Some(color) = as_text(&doc.text_color) {
                    styles.font_color = color;
                }
                if let Some(face) = as_text(&doc.font_family) {
                    styles.font_face = face;
                }
                if let Some(size) = as_number(&doc.font_size) {
                    styles.font_size = size;
                }
                if let Some(bg) = as_number(&doc.use_background) {
                    styles.use_background = bg;
                }
            });
        }
    }
    Ok(())
}

/// The `msgstyles.json` document. The service is loose about types here:
/// sizes arrive as numbers or strings depending on how the style was last
/// saved, so the fields stay raw until coerced.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessageStyles {
    #[serde(rename = "nameColor")]
    name_color: Option<Value>,
    #[serde(rename = "textColor")]
    text_color: Option<Value>,
    #[serde(rename = "fontSize")]
    font_size: Option<Value>,
    #[serde(rename = "fontFamily")]
    font_family: Option<Value>,
    #[serde(rename = "usebackground")]
    use_background: Option<Value>,
}

/// Fetch a user's profile page and cache it unparsed.
pub(crate) async fn fetch_profile(user: &User) -> Result<()> {
    if user.is_anon() {
        return Ok(());
    }
    let url = format!("{}{}mod1.xml", UST_BASE, user_dir(user.name()));
    if let Some(body) = fetch_text(&url).await? {
        user.update_styles(|styles| styles.profile = Some(body));
    }
    Ok(())
}

/// GET a resource, retrying once when the pooled connection was aborted.
/// Non-success statuses read as "no such document".
async fn fetch_text(url: &str) -> Result<Option<String>> {
    let response = match HTTP.get(url).send().await {
        Err(err) if err.is_connect() => HTTP.get(url).send().await?,
        other => other?,
    };
    if !response.status().is_success() {
        return Ok(None);
    }
    Ok(Some(response.text().await?))
}

/// Profile documents live under `/<first>/<second>/<name>/`, with the name
/// doubled when it is too short to supply both prefix characters.
fn user_dir(name: &str) -> String {
    let prefix: Vec<char> = name.repeat(2).chars().take(2).collect();
    let mut dir = String::new();
    for ch in prefix {
        dir.push('/');
        dir.push(ch);
    }
    dir.push('/');
    dir.push_str(name);
    dir.push('/');
    dir
}

fn align_position(align: &str) -> Option<&'static str> {
    match align {
        "tl" => Some("top left"),
        "tr" => Some("top right"),
        "bl" => Some("bottom left"),
        "br" => Some("bottom right"),
        _ => None,
    }
}

fn as_text(field: &Option<Value>) -> Option<String> {
    match field.as_ref()? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn as_number(field: &Option<Value>) -> Option<u32> {
    let value = field.as_ref()?;
    value
        .as_u64()
        .map(|number| number as u32)
        .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_dir_doubles_short_names() {
        assert_eq!(user_dir("bob"), "/b/o/bob/");
        assert_eq!(user_dir("b"), "/b/b/b/");
    }

    #[test]
    fn style_fields_tolerate_mixed_types() {
        let doc: MessageStyles =
            serde_json::from_str(r#"{"nameColor":"cc0000","fontSize":"12","fontFamily":8}"#)
                .unwrap();
        assert_eq!(as_text(&doc.name_color).as_deref(), Some("cc0000"));
        assert_eq!(as_number(&doc.font_size), Some(12));
        assert_eq!(as_text(&doc.font_family).as_deref(), Some("8"));
        assert!(as_number(&doc.use_background).is_none());
    }
}
