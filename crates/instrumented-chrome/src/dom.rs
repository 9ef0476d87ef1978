//! DOM introspection helpers: the JavaScript evaluated in the page and the
//! decoding of protocol payloads back into scanner records.

use scan_types::{ConsoleMessage, JsError, PSEUDO_DOCUMENT, PSEUDO_WINDOW};
use serde_json::Value;

/// Remote-object group used for listener enumeration so every handle can be
/// released in one call afterwards.
pub(crate) const LISTENER_OBJECT_GROUP: &str = "listener-enum";

/// Expression materializing every element of the document as a remote array,
/// in document order.
pub(crate) const ALL_ELEMENTS_EXPRESSION: &str =
    "Array.prototype.slice.call(document.querySelectorAll('*'))";

/// Serializes the current document. An empty string for a document with no
/// root element.
pub(crate) const DOM_EXPRESSION: &str =
    "document.documentElement ? document.documentElement.outerHTML : ''";

/// Called on an element remote object; reports the identity triple used in
/// listener descriptors. Id-based selector when available, structural
/// nth-of-type path otherwise, so the selector resolves back to exactly this
/// node in an unchanged document.
pub(crate) const NODE_IDENTITY_FN: &str = r#"function() {
    function cssPath(el) {
        if (el.id) { return '#' + el.id; }
        var path = [];
        var node = el;
        while (node && node.nodeType === 1) {
            var name = node.nodeName.toLowerCase();
            if (node.id) { path.unshift(name + '#' + node.id); break; }
            var parent = node.parentNode;
            if (!parent || parent.nodeType !== 1) { path.unshift(name); break; }
            var index = 1;
            var sibling = node;
            while ((sibling = sibling.previousElementSibling) !== null) {
                if (sibling.nodeName === node.nodeName) { index += 1; }
            }
            path.unshift(name + ':nth-of-type(' + index + ')');
            node = parent;
        }
        return path.join(' > ');
    }
    return {
        selector: cssPath(this),
        tagName: this.nodeName.toLowerCase(),
        nodeType: this.nodeType
    };
}"#;

/// Expression resolving `selector` (including the reserved pseudo-selectors)
/// and submitting a synthetic event into the page's own event queue. Returns
/// whether a target was found; never waits for handlers to run.
pub(crate) fn dispatch_expression(selector: &str, event_type: &str) -> String {
    let selector_literal = serde_json::to_string(selector).unwrap_or_default();
    let event_literal = serde_json::to_string(event_type).unwrap_or_default();
    format!(
        r#"(function() {{
    var sel = {selector_literal};
    var target = null;
    if (sel === {document_literal}) {{ target = document; }}
    else if (sel === {window_literal}) {{ target = window; }}
    else {{ try {{ target = document.querySelector(sel); }} catch (err) {{ target = null; }} }}
    if (!target) {{ return false; }}
    setTimeout(function() {{
        target.dispatchEvent(new Event({event_literal}, {{ bubbles: true, cancelable: true }}));
    }}, 0);
    return true;
}})()"#,
        selector_literal = selector_literal,
        event_literal = event_literal,
        document_literal = serde_json::to_string(PSEUDO_DOCUMENT).unwrap_or_default(),
        window_literal = serde_json::to_string(PSEUDO_WINDOW).unwrap_or_default(),
    )
}

/// Decode a `Runtime.consoleAPICalled` payload.
pub(crate) fn console_message_from_params(params: &Value) -> ConsoleMessage {
    let level = params["type"].as_str().unwrap_or("log").to_string();
    let text = params["args"]
        .as_array()
        .map(|args| {
            args.iter()
                .map(render_remote_object)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let frame = &params["stackTrace"]["callFrames"][0];
    ConsoleMessage {
        level,
        text,
        url: frame["url"].as_str().map(str::to_string),
        line: frame["lineNumber"].as_u64().map(|n| n as u32),
    }
}

/// Decode a `Runtime.exceptionThrown` payload.
pub(crate) fn js_error_from_params(params: &Value) -> JsError {
    let details = &params["exceptionDetails"];
    let message = details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or("unhandled script error")
        .to_string();

    JsError {
        message,
        url: details["url"].as_str().map(str::to_string),
        line: details["lineNumber"].as_u64().map(|n| n as u32),
        column: details["columnNumber"].as_u64().map(|n| n as u32),
    }
}

fn render_remote_object(arg: &Value) -> String {
    if let Some(text) = arg["value"].as_str() {
        return text.to_string();
    }
    if !arg["value"].is_null() {
        return arg["value"].to_string();
    }
    if let Some(description) = arg["description"].as_str() {
        return description.to_string();
    }
    arg["type"].as_str().unwrap_or("object").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_expression_escapes_selector() {
        let expression = dispatch_expression("a[href=\"x\"]", "click");
        assert!(expression.contains(r#""a[href=\"x\"]""#));
        assert!(expression.contains("setTimeout"));
        assert!(expression.contains("return true;"));
    }

    #[test]
    fn console_message_joins_arguments() {
        let params = json!({
            "type": "warning",
            "args": [
                { "type": "string", "value": "count:" },
                { "type": "number", "value": 3, "description": "3" },
            ],
            "stackTrace": {
                "callFrames": [{ "url": "http://t/app.js", "lineNumber": 12 }]
            }
        });

        let message = console_message_from_params(&params);
        assert_eq!(message.level, "warning");
        assert_eq!(message.text, "count: 3");
        assert_eq!(message.url.as_deref(), Some("http://t/app.js"));
        assert_eq!(message.line, Some(12));
    }

    #[test]
    fn js_error_prefers_exception_description() {
        let params = json!({
            "exceptionDetails": {
                "text": "Uncaught",
                "lineNumber": 4,
                "columnNumber": 9,
                "url": "http://t/",
                "exception": { "description": "ReferenceError: nope is not defined" }
            }
        });

        let error = js_error_from_params(&params);
        assert_eq!(error.message, "ReferenceError: nope is not defined");
        assert_eq!(error.line, Some(4));
        assert_eq!(error.column, Some(9));
    }
}
