use super::RelayError;

pub const GREETING: &str = "Привет! Я помогу разобраться с задачей по шагам. \
Пришли вопрос текстом или фотографию задачи. Чтобы начать заново, отправь /start.";

pub const HELP_TEXT: &str = "Отправь вопрос текстом или фотографию задачи (можно с подписью).\n\
/start — начать разговор заново\n\
/help — показать эту подсказку";

pub const GATEWAY_ERROR: &str = "Извини, сейчас не получилось получить ответ. Попробуй ещё раз чуть позже.";

pub const MEDIA_ERROR: &str = "Не удалось загрузить изображение. Попробуй отправить его ещё раз.";

/// Text shown to the user for a failed exchange.
pub fn for_error(error: &RelayError) -> &'static str {
    match error {
        RelayError::Gateway(_) => GATEWAY_ERROR,
        RelayError::MediaFetch(_) => MEDIA_ERROR,
    }
}
