use rand::Rng;
use rand::thread_rng;
use uuid::Uuid;

use super::shuffle::shuffle_with;
use crate::backend::Question;

/// A question as presented in one session: options in session order and
/// the correct answer re-pointed into that order.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionQuestion {
    pub question_id: Uuid,
    pub text: String,
    pub options: Vec<String>,
    pub correct_index: usize,
}

impl SessionQuestion {
    pub fn is_correct(&self, option_index: usize) -> bool {
        option_index == self.correct_index
    }
}

pub fn build_session(question_bank: &[Question], question_count: usize) -> Vec<SessionQuestion> {
    build_session_with(question_bank, question_count, &mut thread_rng())
}

/// Shuffles the bank, shuffles each question's options and keeps the first
/// `question_count` questions.
pub fn build_session_with<R: Rng + ?Sized>(
    question_bank: &[Question],
    question_count: usize,
    rng: &mut R,
) -> Vec<SessionQuestion> {
    let shuffled_bank = shuffle_with(question_bank, rng);

    shuffled_bank
        .iter()
        .filter_map(|question| {
            let remapped = shuffle_options(question, rng);
            if remapped.is_none() {
                tracing::warn!(
                    question.id = %question.id,
                    question.correct_option = question.correct_option,
                    question.options = question.options.len(),
                    "Dropping question whose correct option does not exist"
                );
            }
            remapped
        })
        .take(question_count)
        .collect()
}

fn shuffle_options<R: Rng + ?Sized>(question: &Question, rng: &mut R) -> Option<SessionQuestion> {
    let tagged: Vec<(usize, &str)> = question
        .options
        .iter()
        .enumerate()
        .map(|(original_index, text)| (original_index, text.as_str()))
        .collect();
    let shuffled = shuffle_with(&tagged, rng);

    let correct_index = shuffled
        .iter()
        .position(|(original_index, _)| *original_index == question.correct_option)?;

    Some(SessionQuestion {
        question_id: question.id,
        text: question.text.clone(),
        options: shuffled.into_iter().map(|(_, text)| text.to_string()).collect(),
        correct_index,
    })
}
