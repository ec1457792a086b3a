// Diagnostic pages rendered by the dev server when it cannot relay a
// response from the simulator.

const STYLE: &str = "<style type=\"text/css\">\
body { background-color: #fff; margin: 40px; font-family: Lucida Grande, Verdana, Sans-serif; font-size: 12px; color: #000; }\
#content { border: #999 1px solid; background-color: #fff; padding: 20px 20px 12px 20px; }\
h1 { font-weight: normal; font-size: 14px; color: #990000; margin: 0 0 4px 0; }\
</style>";

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(content: &str) -> String {
    format!("{STYLE}<div id=\"content\">{content}</div>")
}

pub fn not_found(path: &str) -> String {
    page(&format!(
        "<h1>This page does not exist!</h1><p>Current path: <strong>{}</strong></p>",
        escape(path)
    ))
}

/// A local layout, template or snippet could not be read.
pub fn missing_file(file: &str, kind: &str) -> String {
    page(&format!(
        "<h1>A {kind} file is missing!</h1><p>Expected {kind} location: <strong>{}</strong></p>",
        escape(file),
        kind = escape(kind)
    ))
}

pub fn invalid_access(site: &str) -> String {
    page(&format!(
        "<h1>Invalid access!</h1><p>Your account has no access to the simulator of <strong>{}</strong>.</p>",
        escape(site)
    ))
}

pub fn exception(title: &str, detail: &str) -> String {
    page(&format!(
        "<h1>{}</h1><p>{}</p>",
        escape(title),
        escape(detail)
    ))
}
