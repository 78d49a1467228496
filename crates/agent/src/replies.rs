use prechat_core::domain::PurchaseIntent;
use rand::seq::SliceRandom;

const CURIOUS: &[&str] = &[
    "Olá! Obrigado pelo contato. Como posso ajudá-lo hoje? 😊",
    "Oi! Tudo bem? Aqui é o assistente virtual. Em que posso ser útil?",
    "Bom dia! Seja bem-vindo! Como posso te ajudar?",
    "Oi! Obrigado por entrar em contato. Como posso auxiliá-lo?",
];

const INTERESTED: &[&str] = &[
    "Que ótimo! Temos excelentes produtos/serviços. Posso te passar mais informações sobre qual área te interessa?",
    "Perfeito! Vou te explicar tudo sobre nossos produtos. Qual aspecto te interessa mais?",
    "Excelente! Temos várias opções que podem te atender. Que tipo de solução você está procurando?",
    "Ótimo interesse! Posso te detalhar nossos produtos. Qual categoria te chama mais atenção?",
];

const BUYER: &[&str] = &[
    "Perfeito! Vejo que você tem interesse real. Para te dar o melhor atendimento, preciso de algumas informações:\n\n• Seu nome completo\n• Melhor horário para contato\n• Produto/serviço de interesse\n\nNossa equipe entrará em contato em até 2 horas úteis!",
    "Excelente! Você parece estar pronto para avançar. Vou precisar de alguns dados:\n\n• Nome completo\n• Horário preferido\n• Produto desejado\n\nEntraremos em contato rapidamente!",
    "Que ótimo! Para te atender da melhor forma:\n\n• Nome completo\n• Melhor horário\n• Produto de interesse\n\nNossa equipe te contata em breve!",
];

const HANDOFF: &str =
    "🔄 Sua solicitação foi encaminhada para nosso time de vendas. Você receberá um contato em breve!";

/// Pre-written answers used when the model is unavailable or fails.
#[derive(Clone, Debug)]
pub struct CannedReplies {
    curious: Vec<String>,
    interested: Vec<String>,
    buyer: Vec<String>,
    handoff: String,
}

impl Default for CannedReplies {
    fn default() -> Self {
        let owned = |replies: &[&str]| -> Vec<String> {
            replies.iter().map(|reply| reply.to_string()).collect()
        };
        Self {
            curious: owned(CURIOUS),
            interested: owned(INTERESTED),
            buyer: owned(BUYER),
            handoff: HANDOFF.to_string(),
        }
    }
}

impl CannedReplies {
    pub fn candidates(&self, intent: PurchaseIntent) -> &[String] {
        match intent {
            PurchaseIntent::Curious => &self.curious,
            PurchaseIntent::Interested => &self.interested,
            PurchaseIntent::Buyer => &self.buyer,
        }
    }

    pub fn for_intent(&self, intent: PurchaseIntent) -> String {
        self.candidates(intent)
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| self.handoff.clone())
    }

    /// Sent after a buyer has been handed to the sales team.
    pub fn handoff(&self) -> &str {
        &self.handoff
    }
}
