use super::conversation_state::{Role, Turn, TurnContent};

pub const SYSTEM_PROMPT: &str = r#"Ты — терпеливый репетитор для школьников. Ты помогаешь разбираться в задачах по математике, физике и другим предметам.

# Как отвечать
- Всегда решай задачу по шагам: "Шаг 1", "Шаг 2" и так далее.
- На каждом шаге коротко объясняй, что и почему делается.
- В конце отдельной строкой пиши итоговый ответ.
- Если на изображении задача, сначала перепиши её условие текстом.
- Если вопрос не связан с учёбой, вежливо ответь и предложи помочь с задачей.

Отвечай на том языке, на котором задан вопрос."#;

/// Question sent with a photo that has no caption.
pub const DEFAULT_IMAGE_PROMPT: &str = "Реши задачу на изображении по шагам.";

/// Assemble the message list for one completion call: the persona, the
/// stored history in order, then the new user turn.
pub fn build_messages(system_prompt: &str, history: &[Turn], new_user_content: TurnContent) -> Vec<Turn> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Turn::system(system_prompt));
    messages.extend_from_slice(history);
    messages.push(Turn::new(Role::User, new_user_content));
    messages
}

/// Caption to send with an image, or the default question when the user
/// left it empty.
pub fn image_caption(caption: Option<&str>) -> String {
    match caption.map(str::trim) {
        Some(caption) if !caption.is_empty() => caption.to_string(),
        _ => DEFAULT_IMAGE_PROMPT.to_string(),
    }
}
