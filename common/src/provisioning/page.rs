use crate::config::{DeviceConfig, WebhookMethod};

const PAGE_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>HookButton Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:760px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem;font-weight:bold}
    input[type=text],select,textarea{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555;font-size:.9em}
    button{padding:.55rem .9rem;margin-top:.8rem;width:100%}
  </style>
</head>
<body>
  <h1>HookButton Setup</h1>
  <form action="/save" method="post">
"#;

const PAGE_TAIL: &str = r#"    <button type="submit">Save and Connect</button>
  </form>
</body>
</html>
"#;

/// Shown after a successful save, just before the device restarts.
pub const SAVED_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Configuration Saved</title>
  <style>body{font-family:Arial,sans-serif;margin:2rem;text-align:center}h1{color:#106010}</style>
</head>
<body>
  <h1>Configuration Saved</h1>
  <p>The device will now restart and connect to the WiFi network.</p>
</body>
</html>
"#;

/// Renders the configuration form pre-filled with `config`.
pub fn config_page(config: &DeviceConfig) -> String {
    let mut html = String::with_capacity(PAGE_HEAD.len() + PAGE_TAIL.len() + 2048);
    html.push_str(PAGE_HEAD);

    html.push_str("    <div class=\"card\">\n      <h2>WiFi</h2>\n");
    text_input(&mut html, "ssid", "WiFi SSID", &config.ssid);
    text_input(&mut html, "password", "WiFi Password", &config.password);
    html.push_str("      <p class=\"muted\">Leading and trailing spaces are removed.</p>\n");
    html.push_str("    </div>\n");

    html.push_str("    <div class=\"card\">\n      <h2>Webhook</h2>\n");
    text_input(&mut html, "webhook", "Webhook URL", &config.webhook_url);

    html.push_str(
        "      <label for=\"webhook_method\">HTTP Method</label>\n      <select id=\"webhook_method\" name=\"webhook_method\">\n",
    );
    for method in [WebhookMethod::Get, WebhookMethod::Post] {
        let selected = if method == config.webhook_method {
            " selected"
        } else {
            ""
        };
        html.push_str(&format!(
            "        <option value=\"{0}\"{selected}>{0}</option>\n",
            method.as_str()
        ));
    }
    html.push_str("      </select>\n");

    text_area(
        &mut html,
        "webhook_headers",
        "Headers (one per line)",
        &config.webhook_headers,
    );
    html.push_str("      <p class=\"muted\">Example: Content-Type: application/json</p>\n");
    text_area(
        &mut html,
        "webhook_payload",
        "Request Payload (POST only)",
        &config.webhook_payload,
    );
    html.push_str("    </div>\n");

    html.push_str(PAGE_TAIL);
    html
}

fn text_input(html: &mut String, name: &str, label: &str, value: &str) {
    html.push_str(&format!(
        "      <label for=\"{name}\">{label}</label>\n      <input type=\"text\" id=\"{name}\" name=\"{name}\" value=\"{}\" required>\n",
        escape_html(value)
    ));
}

fn text_area(html: &mut String, name: &str, label: &str, value: &str) {
    html.push_str(&format!(
        "      <label for=\"{name}\">{label}</label>\n      <textarea id=\"{name}\" name=\"{name}\" rows=\"4\">{}</textarea>\n",
        escape_html(value)
    ));
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
