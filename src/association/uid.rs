use std::borrow::Cow;

/// Strip trailing null and space padding from a UID.
pub fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with(|c| c == '\0' || c == ' ') {
        uid.trim_end_matches(|c| c == '\0' || c == ' ')
            .to_string()
            .into()
    } else {
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_uid_removes_padding() {
        assert_eq!(trim_uid("1.2.840.10008.1.1".into()), "1.2.840.10008.1.1");
        assert_eq!(trim_uid("1.2.840.10008.1.1\0".into()), "1.2.840.10008.1.1");
        assert_eq!(trim_uid("1.2.840.10008.1.1 ".into()), "1.2.840.10008.1.1");
    }
}
