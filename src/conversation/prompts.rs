//! Outbound copy. Kept in one place so tests can assert on exact wording.

use crate::listing::fields::ListingField;
use crate::listing::matcher::{CANONICAL_VALUES, option_id};
use crate::ports::{ChoiceOption, MAX_CHOICE_OPTIONS};

pub const WELCOME: &str = "Hi! Let's get your item listed. What's the email address on your seller account?";
pub const ASK_EMAIL: &str = "Please reply with the email address on your seller account.";
pub const INVALID_EMAIL: &str =
    "That doesn't look like an email address. Please send something like name@example.com.";
pub const IDENTITY_REFUSED: &str =
    "We couldn't verify this account from this number. Please contact support if you need help.";
pub const DESCRIBE_ITEM: &str = "Great, you're verified. Tell me about the item: designer, what it is, size, condition and your asking price.";
pub const DESCRIBE_FIRST: &str =
    "Thanks! Before photos, please describe the item so I know what we're listing.";
pub const VOICE_FAILED: &str =
    "Sorry, I couldn't make out that voice note. Could you type it instead?";
pub const UNSUPPORTED: &str = "Sorry, I can only read text, voice notes, photos and button taps.";
pub const START_OVER: &str = "No problem, let's start over. What's the email address on your seller account?";
pub const CANCELLED: &str = "Okay, I've cancelled this listing. Send SELL whenever you want to start again.";
pub const DECLINED_ACCOUNT: &str =
    "No account was created. Send SELL to start again with a different email.";
pub const INVALID_PRICE: &str =
    "I couldn't read that as a price. Please send just the amount, e.g. 80.";
pub const DRAFT_DEFERRED: &str = "I couldn't set up your draft just now. Keep sending photos; I'll retry when you submit.";
pub const ADD_MORE: &str = "Sure, send more photos whenever you're ready.";
pub const TRY_AGAIN: &str = "Something went wrong on our side. Please send your last message again.";

pub const CONFIRM_YES_ID: &str = "confirm_yes";
pub const CONFIRM_NO_ID: &str = "confirm_no";
pub const SUBMIT_ID: &str = "submit_listing";
pub const ADD_MORE_ID: &str = "add_more_photos";

pub fn confirm_account(email: &str) -> (String, Vec<ChoiceOption>) {
    (
        format!("I couldn't find a seller account for {email}. Create a new one?"),
        vec![
            ChoiceOption::new(CONFIRM_YES_ID, "Yes, create it"),
            ChoiceOption::new(CONFIRM_NO_ID, "No"),
        ],
    )
}

/// How to ask for a missing field: a choice message when the closed set fits
/// in the provider's button limit, text otherwise.
pub enum FieldQuestion {
    Text(String),
    Choice(String, Vec<ChoiceOption>),
}

pub fn ask_field(field: ListingField) -> FieldQuestion {
    let options = CANONICAL_VALUES.options(field);
    match field {
        ListingField::AskingPrice => {
            FieldQuestion::Text("What's your asking price? (just the amount)".to_string())
        }
        ListingField::Designer => {
            FieldQuestion::Text("Who is the designer or brand?".to_string())
        }
        _ if options.is_empty() => {
            FieldQuestion::Text(format!("What's the {}?", field.label().to_lowercase()))
        }
        _ if options.len() <= MAX_CHOICE_OPTIONS => FieldQuestion::Choice(
            format!("Which {} fits best?", field.label().to_lowercase()),
            options
                .iter()
                .map(|o| ChoiceOption::new(option_id(field, &o.value), o.value.clone()))
                .collect(),
        ),
        _ => {
            let listed = options
                .iter()
                .map(|o| o.value.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            FieldQuestion::Text(format!(
                "What's the {}? Options: {listed}",
                field.label().to_lowercase()
            ))
        }
    }
}

pub fn request_photos(min: usize) -> String {
    format!("Almost done! Please send at least {min} photos of the item.")
}

pub fn photo_progress(count: usize, min: usize) -> String {
    let remaining = min.saturating_sub(count);
    let noun = if count == 1 { "photo" } else { "photos" };
    format!("Got {count} {noun}. {remaining} more to go.")
}

pub fn photos_ready(count: usize) -> (String, Vec<ChoiceOption>) {
    (
        format!("Got {count} photos, ready to submit! Submit now or add more?"),
        vec![
            ChoiceOption::new(SUBMIT_ID, "Submit"),
            ChoiceOption::new(ADD_MORE_ID, "Add more photos"),
        ],
    )
}

pub fn photo_limit(max: usize) -> String {
    format!("You've reached the maximum of {max} photos. Reply SUBMIT to finish.")
}

pub fn need_more_photos(count: usize, min: usize) -> String {
    let remaining = min.saturating_sub(count);
    let noun = if remaining == 1 { "photo" } else { "photos" };
    format!("Please send {remaining} more {noun} before submitting (you have {count}).")
}

pub fn photo_reminder(count: usize, min: usize) -> String {
    if count == 0 {
        request_photos(min)
    } else {
        format!("You have {count} photo(s) so far. Send more photos, or reply SUBMIT once you have at least {min}.")
    }
}

pub fn submission_failed(stage: &str) -> String {
    format!(
        "We hit a problem while {}. Your progress is saved. Reply SUBMIT to try again.",
        stage_description(stage)
    )
}

pub fn retry_hint() -> &'static str {
    "Your listing is saved but not submitted yet. Reply SUBMIT to try again, or send another photo."
}

pub fn submitted(listing_id: &str) -> String {
    format!("Your listing is in! Reference: {listing_id}. We'll be in touch once it's reviewed.")
}

fn stage_description(stage: &str) -> &'static str {
    match stage {
        "ensure_draft" => "creating your draft",
        "upload_photos" => "uploading your photos",
        "persist_listing" => "saving your listing",
        _ => "submitting",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_fits_in_buttons_and_size_does_not() {
        match ask_field(ListingField::Condition) {
            FieldQuestion::Choice(_, options) => {
                assert_eq!(options.len(), 3);
                assert_eq!(options[1].id, "field:condition:Like New");
            }
            FieldQuestion::Text(text) => panic!("expected buttons, got {text}"),
        }
        match ask_field(ListingField::Size) {
            FieldQuestion::Text(text) => assert!(text.contains("Free Size")),
            FieldQuestion::Choice(..) => panic!("size has more options than buttons"),
        }
    }

    #[test]
    fn price_is_asked_as_text() {
        assert!(matches!(ask_field(ListingField::AskingPrice), FieldQuestion::Text(_)));
    }

    #[test]
    fn progress_copy() {
        assert_eq!(photo_progress(1, 3), "Got 1 photo. 2 more to go.");
        assert_eq!(need_more_photos(2, 3), "Please send 1 more photo before submitting (you have 2).");
        assert!(photos_ready(3).0.starts_with("Got 3 photos, ready to submit"));
    }
}
