//! Placeholder substitution for `remote.html`.
//!
//! Everything here is a pure function of its inputs so the page can be
//! rendered against any snapshot and translation table.

use crate::model::{ConfigSnapshot, ModuleDescriptor};
use std::collections::BTreeMap;

pub type Translation = BTreeMap<String, String>;

const BRIGHTNESS_PLACEHOLDER: &str = "%%REPLACE::BRIGHTNESS%%";
const EDIT_MENU_PLACEHOLDER: &str = "<!-- EDIT_MENU_TEMPLATE -->";
const UPDATE_MENU_PLACEHOLDER: &str = "<!-- UPDATE_MENU_TEMPLATE -->";
const DEFAULT_BRIGHTNESS: i64 = 100;
const MODULE_PREFIX: &str = "MMM-";

pub fn render(template: &str, snapshot: &ConfigSnapshot, translation: &Translation) -> String {
    let page = translate(template, translation);
    let page = fill_edit_menu(&page, snapshot, translation);
    fill_update_menu(&page, snapshot, translation)
}

/// Replaces every `%%TRANSLATE:<key>%%` whose key is in the table.
pub fn translate(data: &str, translation: &Translation) -> String {
    let mut out = data.to_string();
    for (key, value) in translation {
        let pattern = format!("%%TRANSLATE:{key}%%");
        if out.contains(&pattern) {
            out = out.replace(&pattern, value);
        }
    }
    out
}

pub fn fill_edit_menu(data: &str, snapshot: &ConfigSnapshot, translation: &Translation) -> String {
    let brightness = snapshot.brightness_level().unwrap_or(DEFAULT_BRIGHTNESS);
    let data = data.replace(BRIGHTNESS_PLACEHOLDER, &brightness.to_string());

    let Some(modules) = snapshot.module_data.as_deref() else {
        let notice = no_modules_notice("menu-element button edit-menu", translation);
        return data.replacen(EDIT_MENU_PLACEHOLDER, &notice, 1);
    };

    let menu: Vec<String> = modules
        .iter()
        .filter(|m| m.has_position())
        .map(edit_menu_element)
        .collect();
    data.replacen(EDIT_MENU_PLACEHOLDER, &menu.join("\n"), 1)
}

pub fn fill_update_menu(
    data: &str,
    snapshot: &ConfigSnapshot,
    translation: &Translation,
) -> String {
    let Some(modules) = snapshot.module_data.as_deref() else {
        let notice = no_modules_notice("menu-button update-menu", translation);
        return data.replacen(UPDATE_MENU_PLACEHOLDER, &notice, 1);
    };

    let menu: Vec<String> = modules.iter().map(update_menu_element).collect();
    data.replacen(UPDATE_MENU_PLACEHOLDER, &menu.join("\n"), 1)
}

/// `"MMM-Calendar"` -> `"Calendar"`, `"mmm-clock"` -> `"Clock"`.
pub fn format_module_name(name: &str) -> String {
    let stripped = match name.get(..MODULE_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(MODULE_PREFIX) => &name[MODULE_PREFIX.len()..],
        _ => name,
    };
    let mut chars = stripped.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn toggle_state(module: &ModuleDescriptor) -> &'static str {
    if !module.hidden {
        "toggled-on"
    } else if module.is_externally_locked() {
        "toggled-off external-locked"
    } else {
        "toggled-off"
    }
}

fn edit_menu_element(module: &ModuleDescriptor) -> String {
    format!(
        concat!(
            "<div id=\"{id}\" class=\"menu-element button edit-button edit-menu {state}\">\n",
            "<span class=\"stack fa-fw\">\n",
            "<span class=\"fa fa-fw fa-toggle-on outer-label fa-stack-1x\" aria-hidden=\"true\"></span>\n",
            "<span class=\"fa fa-fw fa-toggle-off outer-label fa-stack-1x\" aria-hidden=\"true\"></span>\n",
            "<span class=\"fa fa-fw fa-lock inner-small-label fa-stack-1x\" aria-hidden=\"true\"></span>\n",
            "</span>\n",
            "<span class=\"text\">{name}</span>\n",
            "</div>\n",
        ),
        id = html_escape(&module.identifier),
        state = toggle_state(module),
        name = html_escape(&format_module_name(&module.name)),
    )
}

fn update_menu_element(module: &ModuleDescriptor) -> String {
    format!(
        concat!(
            "<div id=\"{id}\" class=\"menu-button update-button update-menu\">\n",
            "<span class=\"symbol-on-show fa fa-fw fa-toggle-up\" aria-hidden=\"true\"></span>\n",
            "<span class=\"text\">{name}</span>\n",
            "</div>\n",
        ),
        id = html_escape(&module.identifier),
        name = html_escape(&format_module_name(&module.name)),
    )
}

fn no_modules_notice(classes: &str, translation: &Translation) -> String {
    let notice = format!(
        concat!(
            "<div class=\"{classes}\">\n",
            "<span class=\"fa fa-fw fa-exclamation-circle\" aria-hidden=\"true\"></span>\n",
            "<span class=\"text\">%%TRANSLATE:NO_MODULES_LOADED%%</span>\n",
            "</div>\n",
        ),
        classes = classes,
    );
    translate(&notice, translation)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
