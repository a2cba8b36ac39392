use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One terminal preference: its raw key (as written in configuration) and an
/// accessor producing the JSON value sent to the browser.
#[derive(Clone, Copy)]
pub struct PreferenceField {
    pub key: &'static str,
    pub value: fn(&TerminalPreferences) -> Value,
}

impl PreferenceField {
    /// Key as the terminal emulator expects it (`font_size` -> `font-size`).
    pub fn client_key(&self) -> String {
        self.key.replace('_', "-")
    }
}

impl std::fmt::Debug for PreferenceField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceField")
            .field("key", &self.key)
            .finish()
    }
}

macro_rules! terminal_preferences {
    ($($field:ident: $ty:ty,)*) => {
        /// Display options forwarded to the browser's terminal emulator.
        ///
        /// Only the fields whose raw key appears in [`RawPreferenceKeys`] are
        /// ever sent; the rest keep their defaults and stay server side.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct TerminalPreferences {
            $(pub $field: $ty,)*
        }

        /// Static field table, one entry per [`TerminalPreferences`] field.
        pub static PREFERENCE_FIELDS: &[PreferenceField] = &[
            $(PreferenceField {
                key: stringify!($field),
                value: |prefs| serde_json::to_value(&prefs.$field).unwrap_or(Value::Null),
            },)*
        ];
    };
}

terminal_preferences! {
    alt_backspace_is_meta_backspace: bool,
    alt_is_meta: bool,
    alt_sends_what: String,
    audible_bell_sound: String,
    desktop_notification_bell: bool,
    background_color: String,
    background_image: String,
    background_size: String,
    background_position: String,
    backspace_sends_backspace: bool,
    close_on_exit: bool,
    cursor_blink: bool,
    cursor_blink_cycle: Vec<u32>,
    cursor_color: String,
    color_palette_overrides: Vec<Option<String>>,
    copy_on_select: bool,
    use_default_window_copy: bool,
    clear_selection_after_copy: bool,
    ctrl_plus_minus_zero_zoom: bool,
    ctrl_c_copy: bool,
    ctrl_v_paste: bool,
    east_asian_ambiguous_as_two_column: bool,
    enable_8_bit_control: bool,
    enable_bold: bool,
    enable_bold_as_bright: bool,
    enable_clipboard_notice: bool,
    enable_clipboard_write: bool,
    enable_dec12: bool,
    environment: HashMap<String, String>,
    font_family: String,
    font_size: i64,
    font_smoothing: String,
    foreground_color: String,
    home_keys_scroll: bool,
    keybindings: HashMap<String, String>,
    max_string_sequence: i64,
    media_keys_are_fkeys: bool,
    meta_sends_escape: bool,
    mouse_paste_button: i64,
    page_keys_scroll: bool,
    pass_alt_number: bool,
    pass_ctrl_number: bool,
    pass_meta_number: bool,
    pass_meta_v: bool,
    receive_encoding: String,
    scroll_on_keystroke: bool,
    scroll_on_output: bool,
    scrollbar_visible: bool,
    scroll_wheel_move_multiplier: i64,
    send_encoding: String,
    shift_insert_paste: bool,
    user_css: String,
}

/// Raw preference keys the operator actually configured. Acts as the
/// allow-list when building the `SetPreferences` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPreferenceKeys(BTreeSet<String>);

impl RawPreferenceKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys that do not correspond to any known preference field.
    pub fn unrecognized(&self) -> Vec<&str> {
        self.0
            .iter()
            .map(String::as_str)
            .filter(|key| !PREFERENCE_FIELDS.iter().any(|field| field.key == *key))
            .collect()
    }
}

impl TerminalPreferences {
    /// Builds the JSON object sent to the client: every field whose raw key is
    /// allowed, keyed by its hyphenated client name.
    pub fn filtered(&self, allowed: &RawPreferenceKeys) -> Map<String, Value> {
        PREFERENCE_FIELDS
            .iter()
            .filter(|field| allowed.contains(field.key))
            .map(|field| (field.client_key(), (field.value)(self)))
            .collect()
    }
}
