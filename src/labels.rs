use std::borrow::Cow;

pub const MAX_LABEL_CHARS: usize = 50;

const ELLIPSIS: char = '…';

/// Known overlong pathology labels of the effectifs export and their short forms.
/// Only entries whose short form differs are listed, and no short form is itself a key.
pub const PATHOLOGY_ALIASES: &[(&str, &str)] = &[
    (
        "Affections de longue durée (dont 31 et 32) pour d'autres causes",
        "Affections longue durée (autres)",
    ),
    ("Hospitalisation pour Covid-19", "Covid-19"),
    (
        "Hospitalisations hors pathologies repérées (avec ou sans pathologies, traitements ou maternité)",
        "Hospitalisations diverses",
    ),
    (
        "Insuffisance rénale chronique terminale",
        "Insuffisance rénale",
    ),
    (
        "Maladies cardioneurovasculaires",
        "Maladies cardiovasculaires",
    ),
    (
        "Maladies du foie ou du pancréas (hors mucoviscidose)",
        "Maladies hépatiques/pancréatiques",
    ),
    (
        "Maladies inflammatoires ou rares ou infection VIH",
        "Maladies inflammatoires/VIH",
    ),
    (
        "Maladies respiratoires chroniques (hors mucoviscidose)",
        "Maladies respiratoires",
    ),
    ("Maternité (avec ou sans pathologies)", "Maternité"),
    (
        "Pas de pathologie repérée, traitement, maternité, hospitalisation ou traitement antalgique ou anti-inflammatoire",
        "Aucune pathologie repérée",
    ),
    (
        "Traitements antalgiques ou anti-inflammatoires (hors pathologies, traitements, maternité ou hospitalisations)",
        "Traitements antalgiques/anti-inflammatoires",
    ),
    (
        "Traitements du risque vasculaire (hors pathologies)",
        "Traitements risque vasculaire",
    ),
    (
        "Traitements psychotropes (hors pathologies)",
        "Traitements psychotropes",
    ),
];

pub fn alias_for(label: &str) -> Option<&'static str> {
    PATHOLOGY_ALIASES
        .iter()
        .find(|(long, _)| *long == label)
        .map(|(_, short)| *short)
}

pub fn is_long(label: &str) -> bool {
    label.chars().count() > MAX_LABEL_CHARS
}

/// Alias first, then truncation to `MAX_LABEL_CHARS` ending with an ellipsis.
pub fn shorten_label(label: &str) -> Cow<'_, str> {
    let trimmed = label.trim();
    if let Some(short) = alias_for(trimmed) {
        return Cow::Borrowed(short);
    }
    if !is_long(trimmed) {
        return Cow::Borrowed(trimmed);
    }

    let head: String = trimmed.chars().take(MAX_LABEL_CHARS - 1).collect();
    let head = head.trim_end_matches(|ch: char| {
        ch.is_whitespace() || matches!(ch, ',' | ';' | ':' | '(' | '-' | '/' | '.')
    });
    let mut out = String::with_capacity(head.len() + ELLIPSIS.len_utf8());
    out.push_str(head);
    out.push(ELLIPSIS);
    Cow::Owned(out)
}
