//! Reading server status objects out of AMF0 command arguments.

use rml_amf0::Amf0Value;

/// The info object's `key` string, from the first object among `values`.
pub(crate) fn info_field<'a>(values: &'a [Amf0Value], key: &str) -> Option<&'a str> {
    values.iter().find_map(|value| match value {
        Amf0Value::Object(properties) => match properties.get(key) {
            Some(Amf0Value::Utf8String(text)) => Some(text.as_str()),
            _ => None,
        },
        _ => None,
    })
}

/// Status code of an `_error`, or of an `onStatus` at level `error`.
pub(crate) fn error_status(command_name: &str, values: &[Amf0Value]) -> Option<String> {
    let is_error = match command_name {
        "_error" => true,
        "onStatus" => info_field(values, "level") == Some("error"),
        _ => false,
    };
    if !is_error {
        return None;
    }
    let code = info_field(values, "code")
        .or_else(|| info_field(values, "description"))
        .unwrap_or(command_name);
    Some(code.to_string())
}
