//! Canonical key builders: deterministic `:`-separated concatenation, one
//! prefix per artifact family.

pub fn canonical_embedding_key(model_id: &str, input_hash: &str, dim: u32, dtype: &str) -> String {
    format!("emb:{}:{}:{}:{}", model_id, input_hash, dim, dtype)
}

pub fn canonical_prompt_key(tokenizer_id: &str, prompt_hash: &str) -> String {
    format!("prm:{}:{}", tokenizer_id, prompt_hash)
}

pub fn canonical_rag_chunk_key(source_id: &str, chunk_id: &str, rev: &str) -> String {
    format!("rag:{}:{}:{}", source_id, chunk_id, rev)
}

pub fn canonical_rerank_key(
    query_hash: &str,
    index_epoch: &str,
    topk: u32,
    params_hash: &str,
) -> String {
    format!("rrk:{}:{}:{}:{}", query_hash, index_epoch, topk, params_hash)
}

pub fn canonical_response_key(prompt_hash: &str, params_hash: &str, model_id: &str) -> String {
    format!("rsp:{}:{}:{}", prompt_hash, params_hash, model_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_are_deterministic() {
        assert_eq!(
            canonical_embedding_key("m1", "h1", 768, "float16"),
            "emb:m1:h1:768:float16"
        );
        assert_eq!(canonical_prompt_key("tok-a", "ph"), "prm:tok-a:ph");
        assert_eq!(canonical_rag_chunk_key("src", "c7", "r2"), "rag:src:c7:r2");
        assert_eq!(
            canonical_rerank_key("qh", "e5", 20, "ph"),
            "rrk:qh:e5:20:ph"
        );
        assert_eq!(canonical_response_key("ph", "parh", "m2"), "rsp:ph:parh:m2");
    }
}
