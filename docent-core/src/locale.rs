//! Static localized responses for answers that never reach a model.

use crate::types::Language;

/// Fixed messages the pipeline can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Greeting,
    Abusive,
    Gibberish,
    TooShort,
    TooLong,
    NotFound,
    /// Every model provider failed.
    Apology,
}

impl Message {
    /// Text in `language`, falling back to English when no translation exists.
    pub fn text(self, language: &Language) -> &'static str {
        match language {
            Language::Hindi => self.hindi(),
            Language::Marathi => self.marathi(),
            _ => self.english(),
        }
    }

    fn english(self) -> &'static str {
        match self {
            Message::Greeting => {
                "Hello! Ask me anything about your documents and I'll find the answer with page references."
            }
            Message::Abusive => {
                "I'm here to help with questions about your documents. Please keep the conversation respectful."
            }
            Message::Gibberish => {
                "I couldn't understand that. Could you rephrase your question?"
            }
            Message::TooShort => "Your question is too short. Please ask a complete question.",
            Message::TooLong => {
                "Your question is too long. Please shorten it to under 2000 characters."
            }
            Message::NotFound => "I could not find this information in the documents.",
            Message::Apology => {
                "Sorry, I'm unable to answer right now. Please try again in a moment."
            }
        }
    }

    fn hindi(self) -> &'static str {
        match self {
            Message::Greeting => {
                "नमस्ते! अपने दस्तावेज़ों के बारे में कुछ भी पूछें, मैं पृष्ठ संदर्भ के साथ उत्तर दूँगा।"
            }
            Message::Abusive => {
                "मैं आपके दस्तावेज़ों से जुड़े प्रश्नों में मदद के लिए हूँ। कृपया सम्मानजनक भाषा का प्रयोग करें।"
            }
            Message::Gibberish => "मैं इसे समझ नहीं पाया। कृपया अपना प्रश्न दोबारा लिखें।",
            Message::TooShort => "आपका प्रश्न बहुत छोटा है। कृपया पूरा प्रश्न पूछें।",
            Message::TooLong => "आपका प्रश्न बहुत लंबा है। कृपया इसे 2000 अक्षरों से कम करें।",
            Message::NotFound => "यह जानकारी दस्तावेज़ों में नहीं मिली।",
            Message::Apology => "क्षमा करें, मैं अभी उत्तर नहीं दे पा रहा हूँ। कृपया थोड़ी देर बाद पुनः प्रयास करें।",
        }
    }

    fn marathi(self) -> &'static str {
        match self {
            Message::Greeting => {
                "नमस्कार! तुमच्या कागदपत्रांबद्दल काहीही विचारा, मी पृष्ठ संदर्भांसह उत्तर देईन."
            }
            Message::Abusive => {
                "मी तुमच्या कागदपत्रांविषयीच्या प्रश्नांसाठी मदत करतो. कृपया आदरपूर्वक भाषा वापरा."
            }
            Message::Gibberish => "मला हे समजले नाही. कृपया तुमचा प्रश्न पुन्हा लिहा.",
            Message::TooShort => "तुमचा प्रश्न खूप लहान आहे. कृपया पूर्ण प्रश्न विचारा.",
            Message::TooLong => "तुमचा प्रश्न खूप मोठा आहे. कृपया तो 2000 अक्षरांपेक्षा कमी करा.",
            Message::NotFound => "ही माहिती कागदपत्रांमध्ये सापडली नाही.",
            Message::Apology => "क्षमस्व, मी सध्या उत्तर देऊ शकत नाही. कृपया थोड्या वेळाने पुन्हा प्रयत्न करा.",
        }
    }
}
