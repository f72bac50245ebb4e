use crate::models::file_record::ViewType;

const PRIORITY: [(&str, ViewType); 4] = [
    ("image", ViewType::Image),
    ("video", ViewType::Video),
    ("audio", ViewType::Audio),
    ("pdf", ViewType::Pdf),
];

/// Map a media type to its view type.
///
/// Case-sensitive substring match in fixed priority order; anything
/// unrecognised is a plain `File`.
pub fn classify(media_type: &str) -> ViewType {
    PRIORITY
        .iter()
        .find(|(needle, _)| media_type.contains(needle))
        .map(|(_, view_type)| *view_type)
        .unwrap_or(ViewType::File)
}
